//! Thread-safe queues connecting the pipeline workers.
//!
//! "Empty" and "full" are steady-state conditions in this pipeline, so the
//! non-blocking operations return them as values ([`Offer`], [`Take`])
//! instead of errors.
//!
//! The dispatch queue is a [`DispatchQueue`]: it remembers the ids of the
//! items waiting in it until the dispatcher releases them, so the backlog
//! feeder can tell which stored items are already on their way.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Notice;
use crate::item::{Envelope, Item};

/// Result of a non-blocking push.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer<T> {
    /// The value is in the queue.
    Accepted,
    /// The queue is at capacity; the value is handed back.
    Full(T),
    /// Every receiver is gone; the value is handed back.
    Closed(T),
}

impl<T> Offer<T> {
    /// `true` for [`Offer::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, Offer::Accepted)
    }
}

/// Result of a non-blocking pop.
#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    /// A value was waiting.
    Item(T),
    /// Nothing arrived in time.
    Empty,
    /// Every sender is gone.
    Closed,
}

/// A cloneable multi-producer multi-consumer queue.
#[derive(Debug)]
pub struct Queue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// A queue that never reports [`Offer::Full`].
    pub fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// A queue holding at most `capacity` values.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Non-blocking push.
    pub fn offer(&self, value: T) -> Offer<T> {
        match self.tx.try_send(value) {
            Ok(()) => Offer::Accepted,
            Err(TrySendError::Full(value)) => Offer::Full(value),
            Err(TrySendError::Disconnected(value)) => Offer::Closed(value),
        }
    }

    /// Non-blocking pop.
    pub fn try_take(&self) -> Take<T> {
        match self.rx.try_recv() {
            Ok(value) => Take::Item(value),
            Err(TryRecvError::Empty) => Take::Empty,
            Err(TryRecvError::Disconnected) => Take::Closed,
        }
    }

    /// Waits up to `timeout` for a value.
    pub fn take_timeout(&self, timeout: Duration) -> Take<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Take::Item(value),
            Err(RecvTimeoutError::Timeout) => Take::Empty,
            Err(RecvTimeoutError::Disconnected) => Take::Closed,
        }
    }

    /// Number of values waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// `true` when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// `None` for unbounded queues.
    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }

    /// Whether a push would currently be accepted.
    pub fn has_capacity(&self) -> bool {
        match self.capacity() {
            Some(cap) => self.len() < cap,
            None => true,
        }
    }
}

/// Bounded queue of items waiting to be published.
///
/// An item's id is registered when the item is accepted and stays registered
/// until [`DispatchQueue::release`] is called for it, which the dispatcher does
/// once the publish outcome is recorded. Clones share the queue and the ids.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    queue: Queue<Item>,
    queued: Arc<Mutex<HashSet<Uuid>>>,
}

impl DispatchQueue {
    /// A dispatch queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            queue: Queue::bounded(capacity),
            queued: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Non-blocking push; an accepted item's id is registered.
    pub fn offer(&self, item: Item) -> Offer<Item> {
        let mut queued = self.queued.lock();
        let id = item.id();
        let outcome = self.queue.offer(item);
        if outcome.is_accepted() {
            queued.insert(id);
        }
        outcome
    }

    /// Non-blocking pop. The id stays registered until released.
    pub fn try_take(&self) -> Take<Item> {
        self.queue.try_take()
    }

    /// Forgets `id`. Unknown ids are ignored.
    pub fn release(&self, id: &Uuid) {
        self.queued.lock().remove(id);
    }

    /// Ids of the items queued or taken but not yet released.
    pub fn queued_ids(&self) -> HashSet<Uuid> {
        self.queued.lock().clone()
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// `true` when no item is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a push would currently be accepted.
    pub fn has_capacity(&self) -> bool {
        self.queue.has_capacity()
    }
}

/// The four queues of one device pipeline.
#[derive(Debug, Clone)]
pub struct Queues {
    /// Fatal faults raised by workers.
    pub notice: Queue<Notice>,
    /// Commands waiting to be written to the device (without terminator).
    pub write: Queue<String>,
    /// Envelopes waiting for the persistence worker.
    pub persist: Queue<Envelope>,
    /// Items waiting to be published.
    pub dispatch: DispatchQueue,
}

impl Queues {
    /// Creates the queues; only the dispatch queue is bounded.
    pub fn new(dispatch_capacity: usize) -> Self {
        Self {
            notice: Queue::unbounded(),
            write: Queue::unbounded(),
            persist: Queue::unbounded(),
            dispatch: DispatchQueue::bounded(dispatch_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_queue_drops_overflow_without_panicking() {
        let queue: Queue<u32> = Queue::bounded(1);
        let outcomes: Vec<_> = (0..4).map(|i| queue.offer(i)).collect();

        assert_eq!(queue.len(), 1);
        assert!(outcomes[0].is_accepted());
        assert_eq!(outcomes[1..], [Offer::Full(1), Offer::Full(2), Offer::Full(3)]);
        assert_eq!(queue.try_take(), Take::Item(0));
        assert_eq!(queue.try_take(), Take::Empty);
    }

    #[test]
    fn take_timeout_reports_empty() {
        let queue: Queue<u32> = Queue::unbounded();
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), Take::Empty);
        assert!(queue.offer(7).is_accepted());
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), Take::Item(7));
    }

    #[test]
    fn capacity_reflects_occupancy() {
        let queue: Queue<u32> = Queue::bounded(2);
        assert_eq!(queue.capacity(), Some(2));
        assert!(queue.has_capacity());
        queue.offer(1);
        queue.offer(2);
        assert!(!queue.has_capacity());
        assert!(Queue::<u32>::unbounded().has_capacity());
    }

    fn item() -> Item {
        Item::builder(chrono::Utc::now()).build()
    }

    #[test]
    fn dispatch_queue_tracks_ids_until_released() {
        let queue = DispatchQueue::bounded(1);
        let first = item();
        let second = item();

        assert!(queue.offer(first.clone()).is_accepted());
        assert!(!queue.offer(second.clone()).is_accepted());
        assert_eq!(queue.queued_ids(), HashSet::from([first.id()]));

        let taken = match queue.try_take() {
            Take::Item(item) => item,
            other => panic!("unexpected {:?}", other),
        };
        assert!(queue.is_empty());
        assert!(queue.queued_ids().contains(&taken.id()));

        queue.release(&taken.id());
        queue.release(&second.id());
        assert!(queue.queued_ids().is_empty());
    }

    #[test]
    fn dispatch_queue_clones_share_ids() {
        let queue = DispatchQueue::bounded(4);
        let producer = queue.clone();
        let queued = item();
        producer.offer(queued.clone());
        assert_eq!(queue.len(), 1);
        assert!(queue.queued_ids().contains(&queued.id()));
    }

    #[test]
    fn clones_share_the_channel() {
        let queue: Queue<u32> = Queue::unbounded();
        let other = queue.clone();
        other.offer(3);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_take(), Take::Item(3));
    }
}
