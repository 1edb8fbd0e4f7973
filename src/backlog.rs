//! Worker that re-queues stored items that were never confirmed.
//!
//! A pass skips every item that is already on its way: ids registered in the
//! dispatch queue, whichever producer put them there, and ids waiting for an
//! acknowledgement.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::limbo::Limbo;
use crate::queue::{DispatchQueue, Offer};
use crate::store::{ItemStore, PendingQuery};
use crate::worker::{Tick, Worker, WorkerContext};

/// Tuning knobs for [`BacklogFeeder`].
#[derive(Debug, Clone)]
pub struct BacklogSettings {
    /// Only top up when the dispatch queue holds fewer items than this.
    pub low_water_mark: usize,
    /// Most records read per pass.
    pub batch_size: usize,
    /// Records with this many attempts are left alone; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Minimum age of a record before it is retried.
    pub retry_window: Duration,
}

impl Default for BacklogSettings {
    fn default() -> Self {
        Self {
            low_water_mark: 100,
            batch_size: 100,
            max_attempts: Some(3),
            retry_window: Duration::from_secs(30),
        }
    }
}

/// Worker that tops up the dispatch queue from unsent store records.
pub struct BacklogFeeder {
    store: Arc<dyn ItemStore>,
    dispatch: DispatchQueue,
    in_flight: Arc<Limbo>,
    settings: BacklogSettings,
}

impl BacklogFeeder {
    /// A feeder sharing the dispatch queue and pending-ack map with the dispatcher.
    pub fn new(
        store: Arc<dyn ItemStore>,
        dispatch: DispatchQueue,
        in_flight: Arc<Limbo>,
        settings: BacklogSettings,
    ) -> Self {
        Self {
            store,
            dispatch,
            in_flight,
            settings,
        }
    }

    /// Runs one top-up pass and returns how many items were queued.
    pub fn feed(&self) -> usize {
        if self.dispatch.len() >= self.settings.low_water_mark {
            return 0;
        }
        // Queue first: the dispatcher moves an id into limbo before releasing it.
        let mut exclude = self.dispatch.queued_ids();
        exclude.extend(self.in_flight.item_ids());
        let query = PendingQuery {
            max_attempts: self.settings.max_attempts,
            retry_window: self.settings.retry_window,
            exclude,
            limit: self.settings.batch_size,
        };
        let records = match self.store.get_pending(&query) {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "Failed to read pending items");
                return 0;
            }
        };

        let mut queued = 0;
        for record in records {
            match self.dispatch.offer(record.item) {
                Offer::Accepted => queued += 1,
                Offer::Full(item) | Offer::Closed(item) => {
                    debug!(item_id = %item.id(), "Send queue is full, stopping backlog pass");
                    break;
                }
            }
        }
        if queued > 0 {
            info!(queued, "Re-queued stored items");
        }
        queued
    }
}

impl Worker for BacklogFeeder {
    fn name(&self) -> &'static str {
        "backlog"
    }

    fn tick(&mut self, _ctx: &WorkerContext) -> Tick {
        self.feed();
        Tick::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use crate::queue::Take;
    use crate::store::SqliteStore;
    use chrono::Utc;

    fn seeded(n: usize) -> (Arc<SqliteStore>, Vec<Item>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let base = Utc::now() - chrono::Duration::minutes(5);
        let items: Vec<Item> = (0..n).map(|_| Item::builder(Utc::now()).build()).collect();
        for (i, item) in items.iter().enumerate() {
            store
                .insert_at(item, base + chrono::Duration::seconds(i as i64))
                .unwrap();
        }
        (store, items)
    }

    fn feeder(store: Arc<SqliteStore>, dispatch: DispatchQueue, limbo: Arc<Limbo>) -> BacklogFeeder {
        BacklogFeeder::new(store, dispatch, limbo, BacklogSettings::default())
    }

    #[test]
    fn stops_at_first_full_push() {
        let (store, items) = seeded(5);
        let dispatch = DispatchQueue::bounded(2);
        let feeder = feeder(store, dispatch.clone(), Arc::new(Limbo::new()));

        assert_eq!(feeder.feed(), 2);
        let queued: Vec<_> = std::iter::from_fn(|| match dispatch.try_take() {
            Take::Item(item) => Some(item.id()),
            _ => None,
        })
        .collect();
        assert_eq!(queued, vec![items[0].id(), items[1].id()]);
    }

    #[test]
    fn skips_items_in_flight() {
        let (store, items) = seeded(2);
        let limbo = Arc::new(Limbo::new());
        limbo.add(1, items[0].clone());
        let dispatch = DispatchQueue::bounded(10);
        let feeder = feeder(store, dispatch.clone(), limbo);

        assert_eq!(feeder.feed(), 1);
        match dispatch.try_take() {
            Take::Item(item) => assert_eq!(item.id(), items[1].id()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn waiting_items_are_not_queued_twice() {
        let (store, items) = seeded(3);
        let dispatch = DispatchQueue::bounded(10);
        let feeder = BacklogFeeder::new(
            store,
            dispatch.clone(),
            Arc::new(Limbo::new()),
            BacklogSettings {
                retry_window: Duration::ZERO,
                ..Default::default()
            },
        );

        assert_eq!(feeder.feed(), 3);
        assert_eq!(feeder.feed(), 0);
        assert_eq!(feeder.feed(), 0);
        assert_eq!(dispatch.len(), items.len());
    }

    #[test]
    fn items_queued_by_another_producer_are_skipped() {
        let (store, items) = seeded(2);
        let dispatch = DispatchQueue::bounded(10);
        dispatch.offer(items[0].clone());
        let feeder = feeder(store, dispatch.clone(), Arc::new(Limbo::new()));

        assert_eq!(feeder.feed(), 1);
        assert_eq!(dispatch.len(), 2);
    }

    #[test]
    fn taken_items_stay_excluded_until_released() {
        let (store, items) = seeded(1);
        let dispatch = DispatchQueue::bounded(10);
        let feeder = feeder(store, dispatch.clone(), Arc::new(Limbo::new()));

        assert_eq!(feeder.feed(), 1);
        assert!(matches!(dispatch.try_take(), Take::Item(_)));
        assert_eq!(feeder.feed(), 0);

        dispatch.release(&items[0].id());
        assert_eq!(feeder.feed(), 1);
    }

    #[test]
    fn does_nothing_above_low_water_mark() {
        let (store, _) = seeded(3);
        let dispatch = DispatchQueue::bounded(10);
        let feeder = BacklogFeeder::new(
            store,
            dispatch.clone(),
            Arc::new(Limbo::new()),
            BacklogSettings {
                low_water_mark: 1,
                ..Default::default()
            },
        );
        dispatch.offer(Item::builder(Utc::now()).build());
        assert_eq!(feeder.feed(), 0);
        assert_eq!(dispatch.len(), 1);
    }
}
