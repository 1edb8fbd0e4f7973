//! Worker that sends queued commands to the device.

use std::time::Duration;
use tracing::{debug, error};

use super::DeviceLink;
use crate::error::DeviceFault;
use crate::queue::{Queue, Take};
use crate::worker::{Tick, Worker, WorkerContext};

/// Writes queued commands to the device, one per line.
pub struct DeviceWriter {
    link: DeviceLink,
    commands: Queue<String>,
    terminator: String,
    wait: Duration,
}

impl DeviceWriter {
    /// A writer appending `terminator` and waiting at most `wait` per command.
    pub fn new(link: DeviceLink, commands: Queue<String>, terminator: &str, wait: Duration) -> Self {
        Self {
            link,
            commands,
            terminator: terminator.to_string(),
            wait,
        }
    }
}

impl Worker for DeviceWriter {
    fn name(&self) -> &'static str {
        "device-writer"
    }

    fn tick(&mut self, ctx: &WorkerContext) -> Tick {
        let command = match self.commands.take_timeout(self.wait) {
            Take::Item(command) => command,
            Take::Empty => return Tick::Busy,
            Take::Closed => return Tick::Stop,
        };

        let frame = format!("{command}{}", self.terminator);
        match self.link.port().write_all(frame.as_bytes()) {
            Ok(()) => {
                debug!(command = %command, "Sent command to device");
                Tick::Busy
            }
            Err(source) => {
                error!(command = %command, error = %source, "Device disconnected");
                ctx.fail(DeviceFault::LostConnection { source })
            }
        }
    }
}
