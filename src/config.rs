//! Agent configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (every key optional, defaults below)
//! 2. environment variables prefixed with `BUOY_`, where a double
//!    underscore separates nesting levels
//!
//! Durations are written in humantime form (`"200ms"`, `"2m"`).
//!
//! # Example
//! ```no_run
//! use buoy_agent::config::AgentConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // BUOY_MQTT__HOST=broker.local overrides [mqtt] host
//! let config = AgentConfig::load_from("/etc/buoy/agent.toml")?;
//! config.validate()?;
//! println!("Publishing to {}", config.mqtt.topic);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::{self, DeliveryMode, QoS};
use crate::dispatcher::DispatcherSettings;
use crate::error::{AgentError, AgentResult};
use crate::logging::{self, LogFormat};
use crate::validation::{is_in_range, is_not_empty, is_valid_host, is_valid_path, is_valid_port};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BUOY_";

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `[agent]`
    pub agent: AgentSection,
    /// `[serial]`
    pub serial: SerialConfig,
    /// `[mqtt]`
    pub mqtt: MqttConfig,
    /// `[database]`
    pub database: DatabaseConfig,
    /// `[pipeline]`
    pub pipeline: PipelineConfig,
    /// `[backlog]`
    pub backlog: BacklogConfig,
    /// `[network]`
    pub network: NetworkConfig,
    /// `[service]`
    pub service: ServiceConfig,
}

/// Identity of this agent and its logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Device name, used for the PID file and log fields
    pub device_name: String,
    /// Instrument driver: "acmplus" or "pb200"
    pub instrument: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            device_name: "current-meter".to_string(),
            instrument: "acmplus".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Serial link to the instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device path
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
    /// Separates records coming from the device
    pub delimiter: String,
    /// Appended to every command written to the device
    pub terminator: String,
    /// Serial read timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Largest partial record kept while waiting for a delimiter
    pub max_buffer_bytes: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            delimiter: "\n".to_string(),
            terminator: "\r".to_string(),
            read_timeout: Duration::from_secs(1),
            max_buffer_bytes: 64 * 1024,
        }
    }
}

/// Broker connection and delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address
    pub host: String,
    /// Broker port
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// Topic items are published to
    pub topic: String,
    /// 0, 1 or 2
    pub qos: u8,
    /// MQTT keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,
    /// Broker user, if the broker needs one
    pub username: Option<String>,
    /// Broker password
    pub password: Option<String>,
    /// Start each connection with a clean session
    pub clean_session: bool,
    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub reconnect_min_delay: Duration,
    /// Cap for the doubling reconnect delay
    #[serde(with = "humantime_serde")]
    pub reconnect_max_delay: Duration,
    /// How long a connect may stay unanswered
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Only used with `delivery = "sync"`
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// "async" or "sync"
    pub delivery: DeliveryMode,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "buoy-current-meter".to_string(),
            topic: "buoy/current-meter".to_string(),
            qos: 1,
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
            clean_session: true,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            delivery: DeliveryMode::Async,
        }
    }
}

/// Durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; parent directories are created
    pub path: PathBuf,
    /// Wait for a locked database
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/buoy/current-meter.sqlite"),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Worker scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sleep between idle worker ticks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Longest a worker blocks on an empty queue
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    /// Capacity of the send queue
    pub dispatch_capacity: usize,
    /// Reader also hands items straight to the dispatcher
    pub direct_send: bool,
    /// Wait for each worker on shutdown
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            queue_timeout: Duration::from_millis(200),
            dispatch_capacity: 1000,
            direct_send: true,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Re-delivery of stored items
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    /// Top up only below this many queued items
    pub low_water_mark: usize,
    /// Most records read per pass
    pub batch_size: usize,
    /// Records with this many attempts are no longer retried; unset = forever
    pub max_attempts: Option<u32>,
    /// Minimum record age before a retry
    #[serde(with = "humantime_serde")]
    pub retry_window: Duration,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 100,
            batch_size: 100,
            max_attempts: Some(3),
            retry_window: Duration::from_secs(30),
        }
    }
}

/// Reachability probe run before each broker connection attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Disable to connect without probing first
    pub probe: bool,
    /// Host the probe connects to
    pub probe_host: String,
    /// TCP port of the probe host
    pub probe_port: u16,
    /// Timeout of one probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Probes before giving up
    pub max_attempts: u32,
    /// Pause between probes
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe: true,
            probe_host: "8.8.8.8".to_string(),
            probe_port: 53,
            probe_timeout: Duration::from_secs(3),
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Process supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding `<device_name>.pid`
    pub pid_dir: PathBuf,
    /// Pause before the service starts
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pid_dir: PathBuf::from("/var/run/buoy"),
            start_timeout: Duration::ZERO,
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path` and `BUOY_` environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> AgentResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(AgentError::Configuration(format!(
                "Config file '{}' does not exist",
                path.display()
            )));
        }
        Ok(Self::figment(path).extract()?)
    }

    /// The provider chain, file first then environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AgentResult<()> {
        let invalid = |section: &str, msg: &str| {
            AgentError::Configuration(format!("[{}] {}", section, msg))
        };

        logging::parse_log_level(&self.agent.log_level).map_err(AgentError::Configuration)?;
        is_not_empty(&self.agent.device_name).map_err(|e| invalid("agent.device_name", e))?;
        if crate::instrument::by_name(&self.agent.instrument).is_none() {
            return Err(AgentError::Configuration(format!(
                "Unknown instrument '{}'",
                self.agent.instrument
            )));
        }

        is_valid_path(&self.serial.port).map_err(|e| invalid("serial.port", e))?;
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate", "Baud rate must be greater than 0"));
        }
        is_not_empty(&self.serial.delimiter).map_err(|e| invalid("serial.delimiter", e))?;
        if self.serial.max_buffer_bytes == 0 {
            return Err(invalid("serial.max_buffer_bytes", "Buffer limit must be greater than 0"));
        }

        is_valid_host(&self.mqtt.host).map_err(|e| invalid("mqtt.host", e))?;
        is_valid_port(self.mqtt.port).map_err(|e| invalid("mqtt.port", e))?;
        is_not_empty(&self.mqtt.client_id).map_err(|e| invalid("mqtt.client_id", e))?;
        broker::validate_publish(&self.mqtt.topic, "")
            .map_err(|e| invalid("mqtt.topic", &e.to_string()))?;
        is_in_range(self.mqtt.qos, 0..=2).map_err(|e| invalid("mqtt.qos", e))?;
        if self.mqtt.keepalive < Duration::from_secs(5) {
            return Err(invalid("mqtt.keepalive", "Keep-alive must be at least 5s"));
        }
        if self.mqtt.reconnect_min_delay > self.mqtt.reconnect_max_delay {
            return Err(invalid(
                "mqtt.reconnect_min_delay",
                "Minimum reconnect delay exceeds the maximum",
            ));
        }
        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            return Err(invalid("mqtt.password", "Password given without a username"));
        }

        is_valid_path(&self.database.path.to_string_lossy())
            .map_err(|e| invalid("database.path", e))?;

        if self.pipeline.dispatch_capacity == 0 {
            return Err(invalid("pipeline.dispatch_capacity", "Capacity must be at least 1"));
        }
        if self.backlog.batch_size == 0 {
            return Err(invalid("backlog.batch_size", "Batch size must be at least 1"));
        }
        if self.backlog.low_water_mark > self.pipeline.dispatch_capacity {
            return Err(invalid(
                "backlog.low_water_mark",
                "Low water mark exceeds the dispatch capacity",
            ));
        }

        if self.network.probe {
            is_valid_host(&self.network.probe_host).map_err(|e| invalid("network.probe_host", e))?;
            is_valid_port(self.network.probe_port).map_err(|e| invalid("network.probe_port", e))?;
        }

        is_valid_path(&self.service.pid_dir.to_string_lossy())
            .map_err(|e| invalid("service.pid_dir", e))?;

        Ok(())
    }

    /// Publish QoS; out-of-range values fall back to 1.
    pub fn qos(&self) -> QoS {
        QoS::try_from(self.mqtt.qos).unwrap_or(QoS::AtLeastOnce)
    }

    /// Dispatcher settings derived from the `[mqtt]` and `[network]` sections.
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            topic: self.mqtt.topic.clone(),
            qos: self.qos(),
            mode: self.mqtt.delivery,
            reconnect_min_delay: self.mqtt.reconnect_min_delay,
            reconnect_max_delay: self.mqtt.reconnect_max_delay,
            connect_timeout: self.mqtt.connect_timeout,
            ack_timeout: self.mqtt.ack_timeout,
            probe_attempts: self.network.max_attempts,
            probe_delay: self.network.delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AgentConfig::default();
        config.agent.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_topic_rejected() {
        let mut config = AgentConfig::default();
        config.mqtt.topic = "buoy/#".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mqtt.topic"));
    }

    #[test]
    fn test_inverted_reconnect_delays_rejected() {
        let mut config = AgentConfig::default();
        config.mqtt.reconnect_min_delay = Duration::from_secs(300);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_qos_out_of_range() {
        let mut config = AgentConfig::default();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_instrument() {
        let mut config = AgentConfig::default();
        config.agent.instrument = "seabird".to_string();
        assert!(config.validate().is_err());
        config.agent.instrument = "PB200".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatcher_settings() {
        let mut config = AgentConfig::default();
        config.mqtt.qos = 0;
        config.mqtt.delivery = DeliveryMode::Sync;
        let settings = config.dispatcher_settings();
        assert_eq!(settings.qos, QoS::AtMostOnce);
        assert_eq!(settings.mode, DeliveryMode::Sync);
        assert_eq!(settings.topic, "buoy/current-meter");
    }
}
