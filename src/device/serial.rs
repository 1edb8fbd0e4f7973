//! Serial port backend built on the `serialport` crate.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::trace;

use super::{DeviceOpener, DevicePort};
use crate::config::SerialConfig;

/// A [`DevicePort`] over a real serial line.
pub struct SerialDevice {
    port: Box<dyn SerialPort>,
}

impl SerialDevice {
    /// Wraps an open serial port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl DevicePort for SerialDevice {
    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let available = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if available == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0u8; available];
        let n = self.port.read(&mut buffer)?;
        buffer.truncate(n);
        trace!(bytes = n, "Read from serial port");
        Ok(buffer)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn try_clone(&self) -> io::Result<Box<dyn DevicePort>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialDevice::new(port)))
    }
}

/// Opens the configured serial port.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialOpener {
    /// An opener for the `[serial]` port.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self {
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            timeout: config.read_timeout,
        }
    }
}

impl DeviceOpener for SerialOpener {
    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }

    fn open(&self) -> io::Result<Box<dyn DevicePort>> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.timeout)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(SerialDevice::new(port)))
    }
}
