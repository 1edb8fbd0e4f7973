//! Worker that writes envelopes to the durable store.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::item::{Envelope, Item, Status};
use crate::queue::{DispatchQueue, Offer, Queue, Take};
use crate::store::{InsertOutcome, ItemStore};
use crate::worker::{Tick, Worker, WorkerContext};

/// Drains the persist queue into the store and forwards new items to dispatch.
pub struct PersistenceWorker {
    store: Arc<dyn ItemStore>,
    persist: Queue<Envelope>,
    dispatch: Option<DispatchQueue>,
    wait: Duration,
}

impl PersistenceWorker {
    /// A worker waiting at most `wait` for each envelope.
    pub fn new(store: Arc<dyn ItemStore>, persist: Queue<Envelope>, wait: Duration) -> Self {
        Self {
            store,
            persist,
            dispatch: None,
            wait,
        }
    }

    /// Newly stored items are offered to `dispatch` while it has room.
    pub fn forward_to(mut self, dispatch: DispatchQueue) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Applies one envelope to the store. Store errors are logged, never raised.
    pub fn handle(&self, envelope: Envelope) {
        let Envelope { status, item } = envelope;
        match status {
            Status::New => self.save(item),
            Status::Sent => self.set_status(&item, true),
            Status::Failed => self.set_status(&item, false),
        }
    }

    fn save(&self, item: Item) {
        match self.store.insert(&item) {
            Ok(InsertOutcome::Inserted) => self.forward(item),
            Ok(InsertOutcome::Duplicate) => {
                debug!(item_id = %item.id(), "Item already stored")
            }
            Err(err) => error!(item_id = %item.id(), error = %err, "No insert data"),
        }
    }

    fn forward(&self, item: Item) {
        let Some(dispatch) = &self.dispatch else {
            return;
        };
        if !dispatch.has_capacity() {
            return;
        }
        if let Offer::Full(item) | Offer::Closed(item) = dispatch.offer(item) {
            debug!(item_id = %item.id(), "Send queue is full, leaving item for the backlog");
        }
    }

    fn set_status(&self, item: &Item, sent: bool) {
        match self.store.update_status(&[item.id()], sent) {
            Ok(0) => warn!(item_id = %item.id(), sent, "Status update for unknown item"),
            Ok(_) => debug!(item_id = %item.id(), sent, "Updated item status"),
            Err(err) => error!(item_id = %item.id(), error = %err, "Failed to update item status"),
        }
    }
}

impl Worker for PersistenceWorker {
    fn name(&self) -> &'static str {
        "persistence"
    }

    fn tick(&mut self, _ctx: &WorkerContext) -> Tick {
        match self.persist.take_timeout(self.wait) {
            Take::Item(envelope) => {
                self.handle(envelope);
                Tick::Busy
            }
            Take::Empty => Tick::Busy,
            Take::Closed => Tick::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::Utc;

    fn worker(dispatch_capacity: usize) -> (PersistenceWorker, Arc<SqliteStore>, DispatchQueue) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let dispatch = DispatchQueue::bounded(dispatch_capacity);
        let worker = PersistenceWorker::new(
            Arc::clone(&store) as Arc<dyn ItemStore>,
            Queue::unbounded(),
            Duration::from_millis(5),
        )
        .forward_to(dispatch.clone());
        (worker, store, dispatch)
    }

    #[test]
    fn new_items_are_stored_and_forwarded() {
        let (worker, store, dispatch) = worker(1);
        let first = Item::builder(Utc::now()).build();
        let second = Item::builder(Utc::now()).build();

        worker.handle(Envelope::new(first.clone()));
        worker.handle(Envelope::new(second.clone()));

        assert!(store.get(&first.id()).unwrap().is_some());
        assert!(store.get(&second.id()).unwrap().is_some());
        assert_eq!(dispatch.len(), 1);
        assert_eq!(dispatch.queued_ids(), std::collections::HashSet::from([first.id()]));
    }

    #[test]
    fn duplicates_are_not_forwarded_twice() {
        let (worker, store, dispatch) = worker(10);
        let item = Item::builder(Utc::now()).build();

        worker.handle(Envelope::new(item.clone()));
        worker.handle(Envelope::new(item));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(dispatch.len(), 1);
    }

    #[test]
    fn outcomes_update_the_record() {
        let (worker, store, _) = worker(10);
        let item = Item::builder(Utc::now()).build();
        worker.handle(Envelope::new(item.clone()));

        worker.handle(Envelope::failed(item.clone()));
        let record = store.get(&item.id()).unwrap().unwrap();
        assert!(!record.sent);
        assert_eq!(record.num_attempts, 1);

        worker.handle(Envelope::sent(item.clone()));
        let record = store.get(&item.id()).unwrap().unwrap();
        assert!(record.sent);
        assert_eq!(record.num_attempts, 2);
    }

    #[test]
    fn status_for_unknown_item_is_ignored() {
        let (worker, store, _) = worker(10);
        worker.handle(Envelope::sent(Item::builder(Utc::now()).build()));
        assert_eq!(store.count().unwrap(), 0);
    }
}
