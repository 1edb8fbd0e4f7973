//! In-process broker for tests and dry runs.
//!
//! [`MemoryBroker`] records every publish and lets a [`MemoryBrokerHandle`]
//! decide what the "remote" side does: acknowledge, refuse connections, drop
//! the link or reject publishes.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::{validate_publish, Broker, BrokerError, BrokerEvent, MessageId, PublishError, QoS};

/// A publish as seen by the memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Id handed back to the publisher.
    pub id: MessageId,
    /// Topic the payload went to.
    pub topic: String,
    /// Published payload.
    pub payload: String,
    /// Requested quality of service.
    pub qos: QoS,
}

#[derive(Debug)]
struct State {
    events: Option<Sender<BrokerEvent>>,
    next_id: MessageId,
    published: Vec<PublishedMessage>,
    connect_attempts: usize,
    connect_code: u8,
    answer_connect: bool,
    auto_ack: bool,
    reject_publish: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            events: None,
            next_id: 0,
            published: Vec::new(),
            connect_attempts: 0,
            connect_code: 0,
            answer_connect: true,
            auto_ack: false,
            reject_publish: false,
        }
    }
}

impl State {
    fn emit(&mut self, event: BrokerEvent) {
        let delivered = self
            .events
            .as_ref()
            .map_or(false, |events| events.send(event).is_ok());
        if !delivered {
            debug!("Memory broker event dropped, nobody is listening");
        }
    }
}

/// In-process broker for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

/// Test-side control of a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryBrokerHandle {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// A broker plus the handle that controls it.
    pub fn new() -> (Self, MemoryBrokerHandle) {
        let broker = Self::default();
        let handle = MemoryBrokerHandle {
            state: Arc::clone(&broker.state),
        };
        (broker, handle)
    }
}

impl Broker for MemoryBroker {
    fn connect(&mut self, events: Sender<BrokerEvent>) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        state.events = Some(events);
        if state.answer_connect {
            let code = state.connect_code;
            state.emit(BrokerEvent::Connected {
                code,
                session_present: false,
            });
            if code != 0 {
                state.events = None;
            }
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str, qos: QoS) -> Result<MessageId, PublishError> {
        validate_publish(topic, payload)?;
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(PublishError::NotConnected);
        }
        if state.reject_publish {
            return Err(PublishError::ClientClosed("publish rejected".to_string()));
        }
        state.next_id = state.next_id.wrapping_add(1).max(1);
        let id = state.next_id;
        state.published.push(PublishedMessage {
            id,
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos,
        });
        if state.auto_ack {
            state.emit(BrokerEvent::Published(id));
        }
        Ok(id)
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        if state.events.is_some() {
            state.emit(BrokerEvent::Disconnected(0));
            state.events = None;
        }
    }
}

impl MemoryBrokerHandle {
    /// Every publish accepted so far, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Number of connect calls.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// `true` while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Acknowledges the publish with `id`.
    pub fn ack(&self, id: MessageId) {
        self.state.lock().emit(BrokerEvent::Published(id));
    }

    /// Acknowledges every publish as soon as it is made.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.state.lock().auto_ack = enabled;
    }

    /// Answers the following connects with `code`.
    pub fn set_connect_code(&self, code: u8) {
        self.state.lock().connect_code = code;
    }

    /// When false, connects are never answered.
    pub fn set_answer_connect(&self, answer: bool) {
        self.state.lock().answer_connect = answer;
    }

    /// When true, publishes fail with [`PublishError::ClientClosed`].
    pub fn set_reject_publish(&self, reject: bool) {
        self.state.lock().reject_publish = reject;
    }

    /// Ends the connection from the broker side with `code`.
    pub fn drop_connection(&self, code: u8) {
        let mut state = self.state.lock();
        state.emit(BrokerEvent::Disconnected(code));
        state.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_reports_configured_code() {
        let (mut broker, handle) = MemoryBroker::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        handle.set_connect_code(5);
        broker.connect(tx).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            BrokerEvent::Connected {
                code: 5,
                session_present: false
            }
        );
        assert!(!handle.is_connected());
    }

    #[test]
    fn publish_and_ack() {
        let (mut broker, handle) = MemoryBroker::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        broker.connect(tx).unwrap();
        rx.try_recv().unwrap();

        let id = broker.publish("buoy", "{}", QoS::AtLeastOnce).unwrap();
        assert_eq!(handle.published().len(), 1);
        handle.ack(id);
        assert_eq!(rx.try_recv().unwrap(), BrokerEvent::Published(id));
    }

    #[test]
    fn disconnect_reports_clean_code_once() {
        let (mut broker, _handle) = MemoryBroker::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        broker.connect(tx).unwrap();
        rx.try_recv().unwrap();
        broker.disconnect();
        broker.disconnect();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![BrokerEvent::Disconnected(0)]);
    }
}
