//! SQLite implementation of [`ItemStore`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DurableRecord, InsertOutcome, ItemStore, PendingQuery, StoreError};
use crate::item::Item;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid         TEXT    NOT NULL UNIQUE,
    date         TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    sent         INTEGER NOT NULL DEFAULT 0,
    num_attempts INTEGER NOT NULL DEFAULT 0,
    inserted_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS items_pending ON items (sent, inserted_at);
";

const SELECT_COLUMNS: &str = "id, uuid, payload, sent, num_attempts, inserted_at";

/// Row as read from SQLite, before the payload is decoded.
struct RawRecord {
    row_id: i64,
    uuid: String,
    payload: String,
    sent: bool,
    num_attempts: u32,
    inserted_at: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            row_id: row.get(0)?,
            uuid: row.get(1)?,
            payload: row.get(2)?,
            sent: row.get(3)?,
            num_attempts: row.get(4)?,
            inserted_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<DurableRecord, StoreError> {
        let item = Item::from_canonical_json(&self.payload).map_err(|source| {
            StoreError::CorruptRecord {
                uuid: self.uuid.clone(),
                source,
            }
        })?;
        Ok(DurableRecord {
            row_id: self.row_id,
            item,
            sent: self.sent,
            num_attempts: self.num_attempts,
            inserted_at: DateTime::from_timestamp_millis(self.inserted_at).unwrap_or_default(),
        })
    }
}

/// Outbox table in a single SQLite database file.
pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(path, flags)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        connection.execute_batch("PRAGMA synchronous = NORMAL;")?;
        connection.busy_timeout(busy_timeout)?;
        info!(path = %path.display(), "Opened item store");
        Self::with_connection(connection)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(connection: Connection) -> Result<Self, StoreError> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Inserts `item` with an explicit insertion time.
    ///
    /// [`ItemStore::insert`] uses the current time; this is for imports and
    /// for exercising the retry window.
    pub fn insert_at(
        &self,
        item: &Item,
        inserted_at: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let conn = self.connection.lock();
        let result = conn.execute(
            "INSERT INTO items (uuid, date, payload, inserted_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                item.id().to_string(),
                item.date().to_rfc3339(),
                item.to_canonical_json(),
                inserted_at.timestamp_millis(),
            ],
        );
        match result {
            Ok(_) => {
                debug!(item_id = %item.id(), "Stored item");
                Ok(InsertOutcome::Inserted)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                warn!(item_id = %item.id(), "Inserting data already inserted");
                Ok(InsertOutcome::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Number of stored records, sent or not.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.connection.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }
}

impl ItemStore for SqliteStore {
    fn insert(&self, item: &Item) -> Result<InsertOutcome, StoreError> {
        self.insert_at(item, Utc::now())
    }

    fn update_status(&self, ids: &[Uuid], sent: bool) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE items SET sent = ?1, num_attempts = num_attempts + 1 WHERE uuid = ?2",
            )?;
            for id in ids {
                updated += stmt.execute(params![sent, id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn get_pending(&self, query: &PendingQuery) -> Result<Vec<DurableRecord>, StoreError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let window = chrono::Duration::from_std(query.retry_window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(window)
            .map_or(i64::MIN, |t| t.timestamp_millis());
        let max_attempts = query.max_attempts.map_or(i64::MAX, i64::from);
        // Excluded ids can only displace as many rows as there are exclusions.
        let fetch = (query.limit + query.exclude.len()).min(i64::MAX as usize) as i64;

        let raw: Vec<RawRecord> = {
            let conn = self.connection.lock();
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM items \
                 WHERE sent = 0 AND num_attempts < ?1 AND inserted_at <= ?2 \
                 ORDER BY inserted_at, id LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![max_attempts, cutoff, fetch], RawRecord::from_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut records = Vec::with_capacity(query.limit.min(raw.len()));
        for row in raw {
            if records.len() == query.limit {
                break;
            }
            let excluded = Uuid::parse_str(&row.uuid)
                .map(|id| query.exclude.contains(&id))
                .unwrap_or(false);
            if excluded {
                continue;
            }
            match row.decode() {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    fn get(&self, id: &Uuid) -> Result<Option<DurableRecord>, StoreError> {
        let raw = {
            let conn = self.connection.lock();
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM items WHERE uuid = ?1"),
                params![id.to_string()],
                RawRecord::from_row,
            )
            .optional()?
        };
        raw.map(RawRecord::decode).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::collections::HashSet;

    fn item() -> Item {
        Item::builder(Utc::now())
            .field("vx", BigDecimal::from(3))
            .build()
    }

    fn pending(store: &SqliteStore) -> Vec<DurableRecord> {
        store
            .get_pending(&PendingQuery {
                max_attempts: Some(3),
                limit: 100,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = item();
        assert_eq!(store.insert(&item).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&item).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn update_status_bumps_attempts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = item();
        store.insert(&item).unwrap();

        assert_eq!(store.update_status(&[item.id()], false).unwrap(), 1);
        let record = store.get(&item.id()).unwrap().unwrap();
        assert!(!record.sent);
        assert_eq!(record.num_attempts, 1);

        store.update_status(&[item.id()], true).unwrap();
        let record = store.get(&item.id()).unwrap().unwrap();
        assert!(record.sent);
        assert_eq!(record.num_attempts, 2);
    }

    #[test]
    fn update_of_unknown_id_reports_zero() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.update_status(&[Uuid::new_v4()], true).unwrap(), 0);
        assert_eq!(store.update_status(&[], true).unwrap(), 0);
    }

    #[test]
    fn sent_and_exhausted_records_are_not_pending() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sent = item();
        let exhausted = item();
        let fresh = item();
        for i in [&sent, &exhausted, &fresh] {
            store.insert(i).unwrap();
        }
        store.update_status(&[sent.id()], true).unwrap();
        for _ in 0..3 {
            store.update_status(&[exhausted.id()], false).unwrap();
        }

        let ids: Vec<Uuid> = pending(&store).iter().map(|r| r.item.id()).collect();
        assert_eq!(ids, vec![fresh.id()]);
    }

    #[test]
    fn exclusions_do_not_shrink_the_batch() {
        let store = SqliteStore::open_in_memory().unwrap();
        let items: Vec<Item> = (0..4).map(|_| item()).collect();
        let base = Utc::now() - chrono::Duration::seconds(60);
        for (i, item) in items.iter().enumerate() {
            store
                .insert_at(item, base + chrono::Duration::seconds(i as i64))
                .unwrap();
        }

        let query = PendingQuery {
            max_attempts: None,
            retry_window: Duration::from_secs(30),
            exclude: HashSet::from([items[0].id()]),
            limit: 2,
        };
        let ids: Vec<Uuid> = store
            .get_pending(&query)
            .unwrap()
            .iter()
            .map(|r| r.item.id())
            .collect();
        assert_eq!(ids, vec![items[1].id(), items[2].id()]);
    }

    #[test]
    fn stored_payload_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let item = item();
        store.insert(&item).unwrap();
        let record = store.get(&item.id()).unwrap().unwrap();
        assert_eq!(record.item.id(), item.id());
        assert_eq!(record.item.field("vx"), item.field("vx"));
        assert_eq!(record.num_attempts, 0);
    }
}
