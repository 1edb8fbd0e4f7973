//! Instrument-specific behaviour plugged into the generic pipeline.
//!
//! An instrument knows how to turn one framed line into an [`Item`] and how
//! to prepare the device once the workers are running. Everything else
//! (framing, persistence, delivery) is shared.

pub mod acm_plus;
pub mod pb200;

use tracing::warn;

use crate::item::Item;
use crate::queue::{Offer, Queue};

pub use acm_plus::AcmPlus;
pub use pb200::Pb200;

/// Instrument plug-in.
pub trait Instrument: Send + Sync {
    /// Display name used in logs.
    fn name(&self) -> &str;

    /// Decodes one record. Returns `None` for lines that are not measurements.
    fn parse(&self, line: &str) -> Option<Item>;

    /// Sends any initialization commands once the writer is running.
    fn configure(&self, _commands: &CommandSink) {}
}

/// Queues commands for the device writer.
#[derive(Debug, Clone)]
pub struct CommandSink {
    queue: Queue<String>,
}

impl CommandSink {
    /// Wraps the device writer's queue.
    pub fn new(queue: Queue<String>) -> Self {
        Self { queue }
    }

    /// Enqueues a command; the writer appends the line terminator.
    pub fn send(&self, command: impl Into<String>) -> bool {
        match self.queue.offer(command.into()) {
            Offer::Accepted => true,
            Offer::Full(cmd) | Offer::Closed(cmd) => {
                warn!(command = %cmd, "Write queue rejected command");
                false
            }
        }
    }
}

/// Looks up a built-in instrument by its configuration name.
pub fn by_name(name: &str) -> Option<Box<dyn Instrument>> {
    match name.to_ascii_lowercase().as_str() {
        "acmplus" | "acm_plus" | "acm-plus" => Some(Box::new(AcmPlus::new())),
        "pb200" => Some(Box::new(Pb200::new())),
        _ => None,
    }
}
