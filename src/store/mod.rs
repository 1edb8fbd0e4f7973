//! Durable outbox for collected items.
//!
//! Every item the reader produces is written here before (or while) it is
//! published. A record stays `sent = false` until the broker acknowledges it;
//! the backlog feeder re-reads unsent records and queues them again.

pub mod sqlite;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::item::{Item, ItemError};

pub use sqlite::SqliteStore;

/// Store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// A stored payload no longer decodes.
    #[error("Stored payload for {uuid} is not a valid item: {source}")]
    CorruptRecord {
        uuid: String,
        #[source]
        source: ItemError,
    },

    /// The database directory could not be created.
    #[error("Failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of inserting an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was written.
    Inserted,
    /// A record with the same id already exists; nothing was written.
    Duplicate,
}

/// One stored item with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableRecord {
    /// Insertion order.
    pub row_id: i64,
    /// The stored item.
    pub item: Item,
    /// Outcome of the last attempt.
    pub sent: bool,
    /// Publish outcomes recorded so far.
    pub num_attempts: u32,
    /// When the record was written.
    pub inserted_at: DateTime<Utc>,
}

/// Selection of records eligible for (re)delivery.
#[derive(Debug, Clone, Default)]
pub struct PendingQuery {
    /// Records with this many attempts or more are skipped. `None` = no cap.
    pub max_attempts: Option<u32>,
    /// Records inserted less than this long ago are skipped.
    pub retry_window: Duration,
    /// Item ids currently in flight.
    pub exclude: HashSet<Uuid>,
    /// Most records returned.
    pub limit: usize,
}

/// Storage backend used by the persistence worker and the backlog feeder.
pub trait ItemStore: Send + Sync {
    /// Stores a new unsent record; an existing id is left alone.
    fn insert(&self, item: &Item) -> Result<InsertOutcome, StoreError>;

    /// Sets `sent` and bumps `num_attempts` on each listed record.
    ///
    /// Returns the number of records that were found.
    fn update_status(&self, ids: &[Uuid], sent: bool) -> Result<usize, StoreError>;

    /// Unsent records matching `query`, oldest insertion first.
    fn get_pending(&self, query: &PendingQuery) -> Result<Vec<DurableRecord>, StoreError>;

    /// The record for `id`, sent or not.
    fn get(&self, id: &Uuid) -> Result<Option<DurableRecord>, StoreError>;
}
