//! Device I/O boundary and the workers bound to it.
//!
//! The pipeline talks to the instrument through [`DevicePort`], a byte-stream
//! handle with a non-blocking "read whatever is available" and a blocking
//! write. The reader and writer workers each own a clone of the port and share
//! the device's open flag, so closing the device ends both loops.
//!
//! Two ports are provided:
//! - `serial::SerialDevice` on top of the `serialport` crate (feature
//!   `instrument_serial`)
//! - [`mock::MockPort`] for tests and dry runs

pub mod framer;
pub mod mock;
pub mod reader;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod writer;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub use framer::LineFramer;
pub use reader::DeviceReader;
pub use writer::DeviceWriter;

/// Byte-stream handle to the instrument.
pub trait DevicePort: Send {
    /// Returns every byte currently available without waiting for more.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// Writes and flushes `data`.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Opens an independent handle to the same device.
    fn try_clone(&self) -> io::Result<Box<dyn DevicePort>>;
}

/// Opens the device handle when the orchestrator starts.
pub trait DeviceOpener: Send {
    /// Human-readable description of the device location, for logs.
    fn describe(&self) -> String;

    /// Opens the port.
    fn open(&self) -> io::Result<Box<dyn DevicePort>>;
}

/// An open device: the port plus the shared open flag.
pub struct Device {
    port: Option<Box<dyn DevicePort>>,
    open: Arc<AtomicBool>,
    name: String,
}

impl Device {
    /// An open device over `port`.
    pub fn new(name: impl Into<String>, port: Box<dyn DevicePort>) -> Self {
        Self {
            port: Some(port),
            open: Arc::new(AtomicBool::new(true)),
            name: name.into(),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` until closed.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.port.is_some()
    }

    /// The flag device-bound workers gate their loop on.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }

    /// A second handle to the device for a worker thread.
    pub fn link(&self) -> io::Result<DeviceLink> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device is closed"))?
            .try_clone()?;
        Ok(DeviceLink {
            port,
            open: Arc::clone(&self.open),
        })
    }

    /// Closes the device. Safe to call more than once.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if self.port.take().is_some() {
            info!(device = %self.name, "Device closed");
        } else {
            debug!(device = %self.name, "Device already closed");
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

/// A worker's handle to the device.
pub struct DeviceLink {
    port: Box<dyn DevicePort>,
    open: Arc<AtomicBool>,
}

impl DeviceLink {
    /// A link sharing the device's open flag.
    pub fn new(port: Box<dyn DevicePort>, open: Arc<AtomicBool>) -> Self {
        Self { port, open }
    }

    /// The device's open flag.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }

    /// The worker's own port handle.
    pub fn port(&mut self) -> &mut dyn DevicePort {
        self.port.as_mut()
    }
}
