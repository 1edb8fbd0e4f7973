//! Message broker abstraction.
//!
//! The dispatcher only talks to a [`Broker`]. Connection state changes and
//! delivery confirmations never call back into the dispatcher; the broker
//! pushes them as [`BrokerEvent`]s onto the channel handed to
//! [`Broker::connect`], and the dispatcher drains that channel on its own
//! thread.

pub mod memory;
pub mod mqtt;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use memory::MemoryBroker;
pub use mqtt::MqttBroker;

/// Identifier of one publish, scoped to a single broker connection.
pub type MessageId = u16;

/// Largest payload an MQTT PUBLISH can carry.
pub const MAX_PAYLOAD_BYTES: usize = 268_435_455;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged, may be duplicated.
    AtLeastOnce = 1,
    /// Acknowledged exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(other),
        }
    }
}

/// Result of a connection attempt as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    /// Code 0.
    Accepted,
    /// Code 1.
    BadProtocolVersion,
    /// Code 2.
    BadClientId,
    /// Code 3.
    ServerUnavailable,
    /// Code 4.
    BadCredentials,
    /// Code 5.
    NotAuthorized,
    /// Any code MQTT 3.1.1 does not define.
    Other(u8),
}

impl ConnectCode {
    /// Maps a CONNACK return code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => ConnectCode::Accepted,
            1 => ConnectCode::BadProtocolVersion,
            2 => ConnectCode::BadClientId,
            3 => ConnectCode::ServerUnavailable,
            4 => ConnectCode::BadCredentials,
            5 => ConnectCode::NotAuthorized,
            other => ConnectCode::Other(other),
        }
    }

    /// The CONNACK return code.
    pub fn code(&self) -> u8 {
        match self {
            ConnectCode::Accepted => 0,
            ConnectCode::BadProtocolVersion => 1,
            ConnectCode::BadClientId => 2,
            ConnectCode::ServerUnavailable => 3,
            ConnectCode::BadCredentials => 4,
            ConnectCode::NotAuthorized => 5,
            ConnectCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectCode::Accepted => f.write_str("connection accepted"),
            ConnectCode::BadProtocolVersion => {
                f.write_str("connection refused - incorrect protocol version")
            }
            ConnectCode::BadClientId => f.write_str("connection refused - invalid client identifier"),
            ConnectCode::ServerUnavailable => f.write_str("connection refused - server unavailable"),
            ConnectCode::BadCredentials => {
                f.write_str("connection refused - bad username or password")
            }
            ConnectCode::NotAuthorized => f.write_str("connection refused - not authorised"),
            ConnectCode::Other(code) => write!(f, "connection refused - unknown code {code}"),
        }
    }
}

/// Something the broker connection reports to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Answer to a connect request; `code` 0 means accepted.
    Connected { code: u8, session_present: bool },
    /// The connection ended; `code` 0 means a disconnect we asked for.
    Disconnected(u8),
    /// The broker confirmed delivery of a publish.
    Published(MessageId),
}

/// Why a publish was not handed to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Empty topic or one with wildcards.
    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    /// Payload above [`MAX_PAYLOAD_BYTES`].
    #[error("Payload of {0} bytes exceeds the broker limit")]
    PayloadTooLarge(usize),

    /// No open connection.
    #[error("Not connected to the broker")]
    NotConnected,

    /// The client's request channel is gone.
    #[error("Broker client closed: {0}")]
    ClientClosed(String),
}

/// Failure to open a broker connection.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The client could not start connecting.
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    /// Socket or thread setup failed.
    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the dispatcher learns that a publish was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Acks are matched to publishes through the pending-ack map.
    #[default]
    Async,
    /// Each publish waits for its own ack before the next one.
    Sync,
}

/// Publish-side view of a broker connection.
pub trait Broker: Send {
    /// Starts connecting. The outcome arrives later as [`BrokerEvent::Connected`].
    fn connect(&mut self, events: Sender<BrokerEvent>) -> Result<(), BrokerError>;

    /// Publishes `payload`; the id identifies the later acknowledgement.
    fn publish(&mut self, topic: &str, payload: &str, qos: QoS) -> Result<MessageId, PublishError>;

    /// Closes the connection, reporting [`BrokerEvent::Disconnected`] with code 0.
    /// Does nothing when not connected.
    fn disconnect(&mut self);
}

/// Checks a publish request before it reaches the client.
pub fn validate_publish(topic: &str, payload: &str) -> Result<(), PublishError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(PublishError::InvalidTopic(topic.to_string()));
    }
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(PublishError::PayloadTooLarge(payload.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_codes_round_trip() {
        for code in 0..=7 {
            assert_eq!(ConnectCode::from_code(code).code(), code);
        }
        assert_eq!(ConnectCode::from_code(4), ConnectCode::BadCredentials);
        assert!(ConnectCode::from_code(9).to_string().contains("unknown"));
    }

    #[test]
    fn wildcard_topics_are_rejected() {
        assert!(validate_publish("buoy/acm", "{}").is_ok());
        assert_eq!(
            validate_publish("buoy/#", "{}"),
            Err(PublishError::InvalidTopic("buoy/#".into()))
        );
        assert!(validate_publish("", "{}").is_err());
    }

    #[test]
    fn qos_from_level() {
        assert_eq!(QoS::try_from(1), Ok(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(3), Err(3));
    }
}
