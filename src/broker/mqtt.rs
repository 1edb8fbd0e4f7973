//! MQTT broker backed by the synchronous `rumqttc` client.
//!
//! `rumqttc` assigns packet ids inside its event loop, after `publish` has
//! returned. The adapter therefore hands out its own [`MessageId`]s and pairs
//! them with packet ids as the matching `Outgoing::Publish` notifications
//! come out of the event loop, which preserves request order.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rumqttc::{Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use super::{validate_publish, Broker, BrokerError, BrokerEvent, MessageId, PublishError, QoS};
use crate::config::MqttConfig;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Correlation {
    /// Publishes handed to the client, not yet seen leaving the event loop.
    queued: VecDeque<(MessageId, QoS)>,
    /// Packet id -> local id for publishes waiting for PUBACK/PUBCOMP.
    in_flight: HashMap<u16, MessageId>,
}

impl Correlation {
    fn clear(&mut self) {
        self.queued.clear();
        self.in_flight.clear();
    }
}

/// [`Broker`] over a rumqttc client.
pub struct MqttBroker {
    options: MqttOptions,
    client: Option<Client>,
    pump: Option<JoinHandle<()>>,
    correlation: Arc<Mutex<Correlation>>,
    next_id: MessageId,
}

impl MqttBroker {
    /// A disconnected broker using the `[mqtt]` settings.
    pub fn from_config(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keepalive);
        options.set_clean_session(config.clean_session);
        options.set_max_packet_size(super::MAX_PAYLOAD_BYTES, super::MAX_PAYLOAD_BYTES);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        Self {
            options,
            client: None,
            pump: None,
            correlation: Arc::new(Mutex::new(Correlation::default())),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> MessageId {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.next_id
    }
}

impl Broker for MqttBroker {
    fn connect(&mut self, events: Sender<BrokerEvent>) -> Result<(), BrokerError> {
        if self.client.is_some() {
            self.disconnect();
        }
        let (host, port) = self.options.broker_address();
        info!(host = %host, port, client_id = %self.options.client_id(), "Try to connect to broker");

        self.correlation.lock().clear();
        let (client, connection) = Client::new(self.options.clone(), REQUEST_CAPACITY);
        let correlation = Arc::clone(&self.correlation);
        let pump = std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || pump(connection, events, correlation))?;

        self.client = Some(client);
        self.pump = Some(pump);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str, qos: QoS) -> Result<MessageId, PublishError> {
        validate_publish(topic, payload)?;
        let id = self.allocate_id();
        let client = self.client.as_ref().ok_or(PublishError::NotConnected)?;

        let mut correlation = self.correlation.lock();
        client
            .try_publish(topic, to_rumqttc(qos), false, payload.as_bytes().to_vec())
            .map_err(|e| PublishError::ClientClosed(e.to_string()))?;
        correlation.queued.push_back((id, qos));
        Ok(id)
    }

    fn disconnect(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        info!("Disconnecting from broker");
        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "Broker client already closed");
        }
        // The event thread exits on its own once the disconnect goes out.
        self.pump.take();
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn return_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// Drives the `rumqttc` event loop and translates notifications into events.
fn pump(mut connection: Connection, events: Sender<BrokerEvent>, correlation: Arc<Mutex<Correlation>>) {
    let emit = |event: BrokerEvent| events.send(event).is_ok();

    for notification in connection.iter() {
        let keep_going = match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => emit(BrokerEvent::Connected {
                code: return_code(ack.code),
                session_present: ack.session_present,
            }),
            Ok(Event::Incoming(Packet::PubAck(ack))) => complete(&correlation, ack.pkid, &emit),
            Ok(Event::Incoming(Packet::PubComp(comp))) => complete(&correlation, comp.pkid, &emit),
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let mut correlation = correlation.lock();
                match correlation.queued.pop_front() {
                    Some((id, QoS::AtMostOnce)) => emit(BrokerEvent::Published(id)),
                    Some((id, _)) => {
                        correlation.in_flight.insert(pkid, id);
                        true
                    }
                    None => {
                        warn!(pkid, "Publish left the client without a local id");
                        true
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                emit(BrokerEvent::Disconnected(0));
                false
            }
            Ok(_) => true,
            Err(ConnectionError::ConnectionRefused(code)) => {
                emit(BrokerEvent::Connected {
                    code: return_code(code),
                    session_present: false,
                });
                false
            }
            Err(e) => {
                warn!(error = %e, "Broker connection lost");
                emit(BrokerEvent::Disconnected(1));
                false
            }
        };
        if !keep_going {
            break;
        }
    }
    correlation.lock().clear();
    debug!("Broker event loop finished");
}

fn complete(correlation: &Mutex<Correlation>, pkid: u16, emit: &impl Fn(BrokerEvent) -> bool) -> bool {
    match correlation.lock().in_flight.remove(&pkid) {
        Some(id) => emit(BrokerEvent::Published(id)),
        None => {
            debug!(pkid, "Acknowledgment for unknown packet");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> MqttConfig {
        MqttConfig {
            client_id: "buoy-test".into(),
            keepalive: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[test]
    fn publish_requires_a_connection() {
        let mut broker = MqttBroker::from_config(&config());
        assert_eq!(
            broker.publish("buoy/acm", "{}", QoS::AtLeastOnce),
            Err(PublishError::NotConnected)
        );
    }

    #[test]
    fn invalid_topic_fails_before_the_client() {
        let mut broker = MqttBroker::from_config(&config());
        assert!(matches!(
            broker.publish("buoy/+", "{}", QoS::AtLeastOnce),
            Err(PublishError::InvalidTopic(_))
        ));
    }

    #[test]
    fn message_ids_skip_zero() {
        let mut broker = MqttBroker::from_config(&config());
        broker.next_id = u16::MAX;
        assert_eq!(broker.allocate_id(), 1);
        assert_eq!(broker.allocate_id(), 2);
    }

    #[test]
    fn disconnect_without_connection_is_a_no_op() {
        let mut broker = MqttBroker::from_config(&config());
        broker.disconnect();
        broker.disconnect();
    }
}
