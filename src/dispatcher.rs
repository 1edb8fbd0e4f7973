//! Broker dispatcher: keeps the broker connection alive and publishes items.
//!
//! # State machine
//!
//! ```text
//! Disconnected --(reachable, connect ok)--> Connecting --(Connected{0})--> Connected
//!      ^                                        |                              |
//!      +------(refused / connect timeout)-------+                              |
//!      +----------------------------(Disconnected{code != 0})------------------+
//! ```
//!
//! A `Disconnected{0}` event means the disconnect was ours and ends the
//! worker. Every disconnect clears the pending-ack map: message ids are only
//! valid for one connection. Items dropped from the map are still unsent in
//! the store, so the backlog feeder picks them up again.
//!
//! An item taken from the dispatch queue keeps its id registered there until
//! it is either in the pending-ack map or reported failed.
//!
//! Broker events arrive on a channel created per connection attempt. Events
//! from an abandoned attempt land on a channel nobody reads any more.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerEvent, ConnectCode, DeliveryMode, MessageId, QoS};
use crate::item::{Envelope, Item};
use crate::limbo::Limbo;
use crate::network::Reachability;
use crate::queue::{DispatchQueue, Offer, Queue, Take};
use crate::worker::{Tick, Worker, WorkerContext};

/// Connection state as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection; the next attempt waits for the backoff.
    Disconnected,
    /// Connect sent at `since`, waiting for the broker's answer.
    Connecting { since: Instant },
    /// Broker accepted the connection.
    Connected,
}

/// Publishing and reconnect settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Topic every item is published to.
    pub topic: String,
    /// Publish quality of service.
    pub qos: QoS,
    /// Whether each publish waits for its acknowledgement.
    pub mode: DeliveryMode,
    /// First reconnect delay, restored after a successful connect.
    pub reconnect_min_delay: Duration,
    /// Cap for the doubling reconnect delay.
    pub reconnect_max_delay: Duration,
    /// How long a connect may stay unanswered.
    pub connect_timeout: Duration,
    /// Acknowledgement wait in sync mode.
    pub ack_timeout: Duration,
    /// Reachability checks before each connect.
    pub probe_attempts: u32,
    /// Pause between reachability checks.
    pub probe_delay: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            topic: "buoy".to_string(),
            qos: QoS::AtLeastOnce,
            mode: DeliveryMode::Async,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            probe_attempts: 3,
            probe_delay: Duration::from_secs(2),
        }
    }
}

/// Worker that owns the broker connection and publishes queued items.
pub struct Dispatcher {
    broker: Box<dyn Broker>,
    reachability: Box<dyn Reachability>,
    dispatch: DispatchQueue,
    persist: Queue<Envelope>,
    limbo: Arc<Limbo>,
    settings: DispatcherSettings,
    state: LinkState,
    events: Option<Receiver<BrokerEvent>>,
    backoff: Duration,
    next_attempt: Instant,
    stop_requested: bool,
}

impl Dispatcher {
    /// A disconnected dispatcher; the first tick attempts to connect.
    pub fn new(
        broker: Box<dyn Broker>,
        reachability: Box<dyn Reachability>,
        dispatch: DispatchQueue,
        persist: Queue<Envelope>,
        limbo: Arc<Limbo>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            broker,
            reachability,
            dispatch,
            persist,
            limbo,
            backoff: settings.reconnect_min_delay,
            settings,
            state: LinkState::Disconnected,
            events: None,
            next_attempt: Instant::now(),
            stop_requested: false,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// `true` once the broker accepted the connection.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Delay before the next reconnect attempt after a failure.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Whether a clean disconnect has ended this dispatcher.
    pub fn is_stopped(&self) -> bool {
        self.stop_requested
    }

    /// Handles every broker event received so far.
    pub fn drain_events(&mut self) {
        let Some(events) = self.events.clone() else {
            return;
        };
        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
            if self.events.is_none() {
                break;
            }
        }
    }

    /// Applies one broker event.
    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected {
                code: 0,
                session_present,
            } => {
                self.state = LinkState::Connected;
                self.backoff = self.settings.reconnect_min_delay;
                if session_present {
                    info!("Connected to broker using existing session");
                } else {
                    info!("Connected to broker using clean session");
                }
            }
            BrokerEvent::Connected { code, .. } => {
                error!(code, cause = %ConnectCode::from_code(code), "Broker refused connection");
                self.events = None;
                self.state = LinkState::Disconnected;
                self.schedule_retry();
            }
            BrokerEvent::Disconnected(code) => {
                let dropped = self.limbo.clear();
                self.events = None;
                self.state = LinkState::Disconnected;
                if code == 0 {
                    info!(code, dropped, "Disconnected from broker");
                    self.stop_requested = true;
                } else {
                    error!(code, dropped, "Unexpected disconnection from broker");
                    self.schedule_retry();
                }
            }
            BrokerEvent::Published(id) => self.acknowledge(id),
        }
    }

    fn acknowledge(&mut self, id: MessageId) {
        match self.limbo.pop(id) {
            Some(item) => {
                debug!(message_id = id, item_id = %item.id(), "Item delivered");
                self.report(Envelope::sent(item));
            }
            None => warn!(message_id = id, "Acknowledged item isn't in limbo"),
        }
    }

    fn report(&self, envelope: Envelope) {
        if let Offer::Full(envelope) | Offer::Closed(envelope) = self.persist.offer(envelope) {
            error!(item_id = %envelope.item.id(), status = ?envelope.status, "Could not report delivery outcome");
        }
    }

    fn schedule_retry(&mut self) {
        self.next_attempt = Instant::now() + self.backoff;
        debug!(delay = ?self.backoff, "Next broker connection attempt scheduled");
        self.backoff = (self.backoff * 2).min(self.settings.reconnect_max_delay);
    }

    fn try_connect(&mut self) {
        let reachable = self
            .reachability
            .is_reachable(self.settings.probe_attempts, self.settings.probe_delay);
        if !reachable {
            warn!("Broker unreachable, will retry");
            self.schedule_retry();
            return;
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        match self.broker.connect(tx) {
            Ok(()) => {
                self.events = Some(rx);
                self.state = LinkState::Connecting {
                    since: Instant::now(),
                };
            }
            Err(e) => {
                error!(error = %e, "Broker connection attempt failed");
                self.schedule_retry();
            }
        }
    }

    fn abandon_connect(&mut self) {
        warn!(timeout = ?self.settings.connect_timeout, "Broker did not answer the connection request");
        self.events = None;
        self.broker.disconnect();
        self.state = LinkState::Disconnected;
        self.schedule_retry();
    }

    /// Publishes one item, recording it as in flight or reporting it failed.
    pub fn publish(&mut self, item: Item) {
        let payload = item.to_canonical_json();
        match self
            .broker
            .publish(&self.settings.topic, &payload, self.settings.qos)
        {
            Ok(id) => {
                debug!(message_id = id, item_id = %item.id(), "Published item");
                let item_id = item.id();
                self.limbo.add(id, item);
                self.dispatch.release(&item_id);
                if self.settings.mode == DeliveryMode::Sync {
                    self.wait_for_ack(id);
                }
            }
            Err(e) => {
                error!(item_id = %item.id(), error = %e, "Can't send item");
                let item_id = item.id();
                self.report(Envelope::failed(item));
                self.dispatch.release(&item_id);
            }
        }
    }

    /// Blocks until `id` is acknowledged, the link drops or the ack times out.
    fn wait_for_ack(&mut self, id: MessageId) {
        let deadline = Instant::now() + self.settings.ack_timeout;
        while self.limbo.exists(id) {
            let Some(events) = self.events.clone() else {
                return;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(item) = self.limbo.pop(id) {
                        warn!(message_id = id, item_id = %item.id(), "No acknowledgment in time");
                        self.report(Envelope::failed(item));
                    }
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

impl Worker for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    fn tick(&mut self, _ctx: &WorkerContext) -> Tick {
        self.drain_events();
        if self.stop_requested {
            return Tick::Stop;
        }

        match self.state {
            LinkState::Disconnected => {
                if Instant::now() >= self.next_attempt {
                    self.try_connect();
                }
                Tick::Idle
            }
            LinkState::Connecting { since } => {
                if since.elapsed() >= self.settings.connect_timeout {
                    self.abandon_connect();
                }
                Tick::Idle
            }
            LinkState::Connected => match self.dispatch.try_take() {
                Take::Item(item) => {
                    self.publish(item);
                    Tick::Busy
                }
                Take::Empty => Tick::Idle,
                Take::Closed => Tick::Stop,
            },
        }
    }

    fn after_stop(&mut self) {
        self.broker.disconnect();
        self.drain_events();
        self.limbo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryBrokerHandle};
    use crate::network::AlwaysReachable;
    use chrono::Utc;

    struct Fixture {
        dispatcher: Dispatcher,
        handle: MemoryBrokerHandle,
        dispatch: DispatchQueue,
        persist: Queue<Envelope>,
        limbo: Arc<Limbo>,
        ctx: WorkerContext,
    }

    fn fixture(settings: DispatcherSettings) -> Fixture {
        let (broker, handle) = MemoryBroker::new();
        let dispatch = DispatchQueue::bounded(10);
        let persist = Queue::unbounded();
        let limbo = Arc::new(Limbo::new());
        let dispatcher = Dispatcher::new(
            Box::new(broker),
            Box::new(AlwaysReachable),
            dispatch.clone(),
            persist.clone(),
            Arc::clone(&limbo),
            settings,
        );
        Fixture {
            dispatcher,
            handle,
            dispatch,
            persist,
            limbo,
            ctx: WorkerContext::new("dispatcher", Queue::unbounded()),
        }
    }

    fn connected(settings: DispatcherSettings) -> Fixture {
        let mut f = fixture(settings);
        f.dispatcher.tick(&f.ctx);
        f.dispatcher.tick(&f.ctx);
        assert!(f.dispatcher.is_connected());
        f
    }

    fn item() -> Item {
        Item::builder(Utc::now()).build()
    }

    #[test]
    fn connects_on_first_ticks() {
        let mut f = fixture(DispatcherSettings::default());
        f.dispatcher.tick(&f.ctx);
        assert!(matches!(f.dispatcher.state(), LinkState::Connecting { .. }));
        f.dispatcher.tick(&f.ctx);
        assert_eq!(f.dispatcher.state(), LinkState::Connected);
        assert_eq!(f.handle.connect_attempts(), 1);
    }

    #[test]
    fn ack_reports_sent() {
        let mut f = connected(DispatcherSettings::default());
        let item = item();
        f.dispatch.offer(item.clone());
        assert_eq!(f.dispatcher.tick(&f.ctx), Tick::Busy);
        assert_eq!(f.limbo.size(), 1);
        assert!(f.dispatch.queued_ids().is_empty());
        assert!(f.limbo.item_ids().contains(&item.id()));

        let id = f.handle.published()[0].id;
        f.handle.ack(id);
        f.dispatcher.tick(&f.ctx);

        assert_eq!(f.limbo.size(), 0);
        assert_eq!(f.persist.try_take(), Take::Item(Envelope::sent(item)));
    }

    #[test]
    fn unknown_ack_is_ignored() {
        let mut f = connected(DispatcherSettings::default());
        f.handle.ack(42);
        f.dispatcher.tick(&f.ctx);
        assert!(f.persist.is_empty());
    }

    #[test]
    fn publish_failure_reports_failed_without_limbo_entry() {
        let mut f = connected(DispatcherSettings::default());
        f.handle.set_reject_publish(true);
        let item = item();
        f.dispatch.offer(item.clone());
        f.dispatcher.tick(&f.ctx);

        assert_eq!(f.limbo.size(), 0);
        assert!(f.dispatch.queued_ids().is_empty());
        assert_eq!(f.persist.try_take(), Take::Item(Envelope::failed(item)));
    }

    #[test]
    fn clean_disconnect_clears_limbo_and_stops() {
        let mut f = connected(DispatcherSettings::default());
        f.limbo.add(1, item());
        f.dispatcher.handle_event(BrokerEvent::Disconnected(0));
        assert_eq!(f.limbo.size(), 0);
        assert!(f.dispatcher.is_stopped());
        assert_eq!(f.dispatcher.tick(&f.ctx), Tick::Stop);
    }

    #[test]
    fn unexpected_disconnect_clears_limbo_and_reconnects() {
        let mut f = connected(DispatcherSettings {
            reconnect_min_delay: Duration::ZERO,
            ..Default::default()
        });
        f.limbo.add(1, item());
        f.handle.drop_connection(7);

        assert_eq!(f.dispatcher.tick(&f.ctx), Tick::Idle);
        assert_eq!(f.limbo.size(), 0);
        assert!(!f.dispatcher.is_stopped());
        assert!(matches!(f.dispatcher.state(), LinkState::Connecting { .. }));
        f.dispatcher.tick(&f.ctx);
        assert!(f.dispatcher.is_connected());
        assert_eq!(f.handle.connect_attempts(), 2);
    }

    #[test]
    fn refused_connect_backs_off() {
        let mut f = fixture(DispatcherSettings {
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(3),
            ..Default::default()
        });
        f.handle.set_connect_code(4);
        f.dispatcher.tick(&f.ctx);
        f.dispatcher.tick(&f.ctx);
        assert_eq!(f.dispatcher.state(), LinkState::Disconnected);
        assert_eq!(f.dispatcher.backoff(), Duration::from_secs(2));

        f.dispatcher.handle_event(BrokerEvent::Connected {
            code: 3,
            session_present: false,
        });
        f.dispatcher.handle_event(BrokerEvent::Connected {
            code: 3,
            session_present: false,
        });
        assert_eq!(f.dispatcher.backoff(), Duration::from_secs(3));
    }

    #[test]
    fn unanswered_connect_times_out() {
        let mut f = fixture(DispatcherSettings {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        });
        f.handle.set_answer_connect(false);
        f.dispatcher.tick(&f.ctx);
        assert!(matches!(f.dispatcher.state(), LinkState::Connecting { .. }));
        f.dispatcher.tick(&f.ctx);
        assert_eq!(f.dispatcher.state(), LinkState::Disconnected);
        assert!(!f.dispatcher.is_stopped());
    }

    #[test]
    fn sync_mode_fails_unacknowledged_publish() {
        let mut f = connected(DispatcherSettings {
            mode: DeliveryMode::Sync,
            ack_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let item = item();
        f.dispatch.offer(item.clone());
        f.dispatcher.tick(&f.ctx);

        assert_eq!(f.limbo.size(), 0);
        assert_eq!(f.persist.try_take(), Take::Item(Envelope::failed(item)));
    }

    #[test]
    fn sync_mode_waits_for_ack() {
        let mut f = connected(DispatcherSettings {
            mode: DeliveryMode::Sync,
            ack_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        f.handle.set_auto_ack(true);
        let item = item();
        f.dispatch.offer(item.clone());
        f.dispatcher.tick(&f.ctx);

        assert_eq!(f.limbo.size(), 0);
        assert_eq!(f.persist.try_take(), Take::Item(Envelope::sent(item)));
    }

    #[test]
    fn items_wait_while_disconnected() {
        let mut f = fixture(DispatcherSettings::default());
        f.handle.set_answer_connect(false);
        let waiting = item();
        f.dispatch.offer(waiting.clone());
        f.dispatcher.tick(&f.ctx);
        f.dispatcher.tick(&f.ctx);
        assert_eq!(f.dispatch.len(), 1);
        assert!(f.dispatch.queued_ids().contains(&waiting.id()));
        assert!(f.handle.published().is_empty());
    }
}
