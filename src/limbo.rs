//! Pending-acknowledgment map ("limbo") for in-flight publishes.
//!
//! Message ids are scoped to one broker connection and get reused after a
//! reconnect, so the whole map must be cleared on every disconnect.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::broker::MessageId;
use crate::item::Item;

/// Items published on the current connection and not yet acknowledged, by message id.
#[derive(Debug, Default)]
pub struct Limbo {
    items: Mutex<HashMap<MessageId, Item>>,
}

impl Limbo {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an in-flight item. A previous entry under the same id is replaced.
    pub fn add(&self, id: MessageId, item: Item) {
        self.items.lock().insert(id, item);
    }

    /// `true` while `id` waits for its acknowledgement.
    pub fn exists(&self, id: MessageId) -> bool {
        self.items.lock().contains_key(&id)
    }

    /// A copy of the item under `id`.
    pub fn get(&self, id: MessageId) -> Option<Item> {
        self.items.lock().get(&id).cloned()
    }

    /// Removes and returns the entry for `id`; a second pop returns `None`.
    pub fn pop(&self, id: MessageId) -> Option<Item> {
        self.items.lock().remove(&id)
    }

    /// Forgets every entry and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    /// Identifiers of the items currently awaiting acknowledgment.
    pub fn item_ids(&self) -> HashSet<Uuid> {
        self.items.lock().values().map(Item::id).collect()
    }
}
