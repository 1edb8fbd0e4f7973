//! In-memory device port for tests and dry runs.
//!
//! The port and its [`MockControl`] share state: the control side queues
//! inbound chunks, inspects what was written and can make the next I/O call
//! fail as if the cable had been pulled.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{DeviceOpener, DevicePort};

#[derive(Debug, Default)]
struct Shared {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    unplugged: AtomicBool,
}

/// Mock [`DevicePort`]. Each `read_available` returns one queued chunk.
#[derive(Debug, Clone)]
pub struct MockPort {
    shared: Arc<Shared>,
}

/// Test-side handle of a [`MockPort`].
#[derive(Debug, Clone)]
pub struct MockControl {
    shared: Arc<Shared>,
}

impl MockPort {
    /// A port plus the handle that drives it.
    pub fn new() -> (Self, MockControl) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockControl { shared },
        )
    }

    fn check(&self) -> io::Result<()> {
        if self.shared.unplugged.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
        } else {
            Ok(())
        }
    }
}

impl DevicePort for MockPort {
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        self.check()?;
        Ok(self.shared.inbound.lock().pop_front().unwrap_or_default())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.check()?;
        self.shared.written.lock().extend_from_slice(data);
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn DevicePort>> {
        Ok(Box::new(self.clone()))
    }
}

impl MockControl {
    /// Queues a chunk for the next read.
    pub fn feed(&self, chunk: impl AsRef<[u8]>) {
        self.shared.inbound.lock().push_back(chunk.as_ref().to_vec());
    }

    /// Chunks fed but not read yet.
    pub fn pending_chunks(&self) -> usize {
        self.shared.inbound.lock().len()
    }

    /// Everything written to the device so far, decoded lossily.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.shared.written.lock()).into_owned()
    }

    /// Makes every following read and write fail.
    pub fn unplug(&self) {
        self.shared.unplugged.store(true, Ordering::SeqCst);
    }
}

/// Opener returning clones of one mock port, or failing when absent.
#[derive(Debug, Clone)]
pub struct MockOpener {
    port: Option<MockPort>,
}

impl MockOpener {
    /// An opener handing out clones of `port`.
    pub fn new(port: MockPort) -> Self {
        Self { port: Some(port) }
    }

    /// An opener for a device that is not plugged in.
    pub fn missing() -> Self {
        Self { port: None }
    }
}

impl DeviceOpener for MockOpener {
    fn describe(&self) -> String {
        "mock".to_string()
    }

    fn open(&self) -> io::Result<Box<dyn DevicePort>> {
        match &self.port {
            Some(port) => Ok(Box::new(port.clone())),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such device")),
        }
    }
}
