//! Custom error types for the agent.
//!
//! This module defines the primary error type, `AgentError`, together with the
//! fault type that workers put on the notice queue. Using the `thiserror` crate,
//! it provides a centralized and consistent way to handle the different kinds
//! of failure the pipeline can run into.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration file or environment.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically
//!   invalid (a zero port, an empty topic). Caught by `AgentConfig::validate`.
//! - **`Store`** / **`Broker`**: Failures of the durable store and the broker
//!   integration. These are usually handled locally by the worker that hit them.
//! - **`Device`**: A fatal [`DeviceFault`] re-raised by the orchestrator.
//!
//! Device faults are the only errors that travel between threads. They are
//! wrapped in a [`Notice`] carrying a [`NoticeLevel`] and the time they were
//! raised, so that the supervisor can log and prioritise them.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::store::StoreError;

/// Convenience alias for results using the agent error type.
pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Errors that end the agent or one of its pipelines.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The configuration could not be read or typed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration was read but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or thread error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker failure.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A worker reported a fatal device fault.
    #[error("Device fault ({level}): {fault}")]
    Device { fault: DeviceFault, level: NoticeLevel },

    /// The SIGINT/SIGTERM handler could not be installed.
    #[error("Failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// Built without serial support.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl From<Notice> for AgentError {
    fn from(notice: Notice) -> Self {
        AgentError::Device {
            fault: notice.fault,
            level: notice.level,
        }
    }
}

/// Faults that make the device pipeline unusable.
///
/// Every variant is fatal: once one of these reaches the orchestrator the
/// whole agent is torn down and the supervisor exits with a failure status.
#[derive(Error, Debug)]
pub enum DeviceFault {
    /// The device could not be opened.
    #[error("Device not detected: {device}")]
    NotDetected {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// A read or write failed on an open device.
    #[error("Lost connection to the device")]
    LostConnection {
        #[source]
        source: std::io::Error,
    },

    /// The device sent data that cannot be framed.
    #[error("Error processing device data: {0}")]
    ProcessData(String),
}

impl DeviceFault {
    /// Severity used when this fault is reported.
    pub fn level(&self) -> NoticeLevel {
        match self {
            DeviceFault::NotDetected { .. }
            | DeviceFault::LostConnection { .. }
            | DeviceFault::ProcessData(_) => NoticeLevel::Critical,
        }
    }
}

/// Severity of a notice. Lower numeric values are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum NoticeLevel {
    /// Ends the pipeline.
    Critical = 1,
    /// Needs attention.
    High = 3,
    /// Informational.
    Normal = 5,
    /// Background noise.
    Low = 10,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NoticeLevel::Critical => "CRITICAL",
            NoticeLevel::High => "HIGH",
            NoticeLevel::Normal => "NORMAL",
            NoticeLevel::Low => "LOW",
        };
        f.write_str(name)
    }
}

/// A fault as it travels on the notice queue.
#[derive(Debug)]
pub struct Notice {
    /// What went wrong.
    pub fault: DeviceFault,
    /// Severity of `fault`.
    pub level: NoticeLevel,
    /// When the worker raised it.
    pub raised_at: DateTime<Utc>,
    /// Name of the worker that raised the fault.
    pub worker: &'static str,
}

impl Notice {
    /// A notice stamped now, with the fault's own level.
    pub fn new(worker: &'static str, fault: DeviceFault) -> Self {
        Self {
            level: fault.level(),
            fault,
            raised_at: Utc::now(),
            worker,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}: {}",
            self.raised_at.to_rfc3339(),
            self.level,
            self.worker,
            self.fault
        )
    }
}
