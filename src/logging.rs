//! Logging setup.
//!
//! The agent logs through `tracing`; this module installs the
//! `tracing-subscriber` registry that formats those events. Every worker
//! runs on a named thread, so thread names are on by default and each line
//! can be traced back to the worker that wrote it.
//!
//! `RUST_LOG` takes precedence over the configured level.
//!
//! # Example
//! ```no_run
//! use buoy_agent::logging::{self, LogFormat, LoggingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), String> {
//! logging::init(LoggingConfig::new(Level::DEBUG).with_format(LogFormat::Json))?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::AgentConfig;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured output for a terminal.
    #[default]
    Pretty,
    /// One line per event, no colours (syslog / journald).
    Compact,
    /// One JSON object per event.
    Json,
}

/// Settings for the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Include source locations.
    pub with_file_and_line: bool,
    /// Include the worker thread name.
    pub with_thread_names: bool,
    /// Colours, Pretty format only.
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the `[agent]` section.
    pub fn from_agent_config(config: &AgentConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.agent.log_level)?;
        Ok(Self {
            level,
            format: config.agent.log_format,
            ..Default::default()
        })
    }

    /// Sets the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Turns colours on or off.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Installs the global subscriber.
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`,
/// which keeps tests that each initialize logging from failing.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize logging: {}", e))
            }
        })
}

/// Parses a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
