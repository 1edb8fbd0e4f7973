//! Measurement items and the envelopes that carry them into persistence.
//!
//! An [`Item`] is one instrument reading. Its numeric fields are exact
//! decimals so that the payload sent to the broker and the row kept in the
//! store never drift apart through float formatting. Items are immutable once
//! built: derived fields are computed by the instrument parser before the item
//! is constructed and are stored like any other field.
//!
//! The canonical form of an item is compact JSON with sorted keys:
//!
//! ```text
//! {"date":"2024-05-01T10:00:00.000Z","speed":"5.000","uuid":"…","vx":"3.0","vy":"4.0"}
//! ```

use bigdecimal::BigDecimal;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Keys reserved for the identity of an item in its canonical form.
const KEY_UUID: &str = "uuid";
const KEY_DATE: &str = "date";

/// Failure to decode an item from its canonical JSON.
#[derive(Error, Debug)]
pub enum ItemError {
    /// Not JSON.
    #[error("Invalid item JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON, but not an object.
    #[error("Item payload is not a JSON object")]
    NotAnObject,

    /// `uuid` or `date` is missing.
    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    /// A value does not fit its field.
    #[error("Invalid value for field '{field}': {value}")]
    InvalidValue { field: String, value: String },
}

/// A single measurement record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    id: Uuid,
    date: DateTime<Utc>,
    fields: BTreeMap<String, BigDecimal>,
}

impl Item {
    /// Starts building an item with a fresh random identifier.
    pub fn builder(date: DateTime<Utc>) -> ItemBuilder {
        ItemBuilder {
            id: Uuid::new_v4(),
            date,
            fields: BTreeMap::new(),
        }
    }

    /// Stable identity across store and broker.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Measurement time.
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    /// Value of one measured field.
    pub fn field(&self, name: &str) -> Option<&BigDecimal> {
        self.fields.get(name)
    }

    /// All measured fields, by name.
    pub fn fields(&self) -> &BTreeMap<String, BigDecimal> {
        &self.fields
    }

    /// Renders the canonical JSON used for broker payloads and storage.
    pub fn to_canonical_json(&self) -> String {
        // serde_json's default map is ordered, which gives the sorted keys.
        let mut map = Map::new();
        map.insert(
            KEY_DATE.to_string(),
            Value::String(self.date.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        map.insert(KEY_UUID.to_string(), Value::String(self.id.to_string()));
        for (name, value) in &self.fields {
            map.insert(name.clone(), Value::String(value.to_string()));
        }
        Value::Object(map).to_string()
    }

    /// Rebuilds an item from its canonical JSON form.
    pub fn from_canonical_json(json: &str) -> Result<Self, ItemError> {
        let value: Value = serde_json::from_str(json)?;
        let Value::Object(mut map) = value else {
            return Err(ItemError::NotAnObject);
        };

        let id = match map.remove(KEY_UUID) {
            Some(Value::String(raw)) => {
                Uuid::parse_str(&raw).map_err(|_| ItemError::InvalidValue {
                    field: KEY_UUID.to_string(),
                    value: raw,
                })?
            }
            Some(other) => {
                return Err(ItemError::InvalidValue {
                    field: KEY_UUID.to_string(),
                    value: other.to_string(),
                })
            }
            None => return Err(ItemError::MissingField(KEY_UUID)),
        };

        let date = match map.remove(KEY_DATE) {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| ItemError::InvalidValue {
                    field: KEY_DATE.to_string(),
                    value: raw,
                })?,
            Some(other) => {
                return Err(ItemError::InvalidValue {
                    field: KEY_DATE.to_string(),
                    value: other.to_string(),
                })
            }
            None => return Err(ItemError::MissingField(KEY_DATE)),
        };

        let mut fields = BTreeMap::new();
        for (name, value) in map {
            let raw = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(ItemError::InvalidValue {
                        field: name,
                        value: other.to_string(),
                    })
                }
            };
            let decimal = BigDecimal::from_str(&raw).map_err(|_| ItemError::InvalidValue {
                field: name.clone(),
                value: raw.clone(),
            })?;
            fields.insert(name, decimal);
        }

        Ok(Self { id, date, fields })
    }
}

/// Builder for [`Item`]. Fields can only be set before the item exists.
#[derive(Debug, Clone)]
pub struct ItemBuilder {
    id: Uuid,
    date: DateTime<Utc>,
    fields: BTreeMap<String, BigDecimal>,
}

impl ItemBuilder {
    /// Overrides the generated identifier.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Sets a decimal field. Reserved names (`uuid`, `date`) are ignored.
    pub fn field(mut self, name: &str, value: BigDecimal) -> Self {
        if name != KEY_UUID && name != KEY_DATE {
            self.fields.insert(name.to_string(), value);
        }
        self
    }

    /// Sets a field when a value is present.
    pub fn maybe_field(self, name: &str, value: Option<BigDecimal>) -> Self {
        match value {
            Some(value) => self.field(name, value),
            None => self,
        }
    }

    /// Finishes the item.
    pub fn build(self) -> Item {
        Item {
            id: self.id,
            date: self.date,
            fields: self.fields,
        }
    }
}

/// Which store operation an envelope asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Insert the item.
    New,
    /// Mark it delivered.
    Sent,
    /// Count a failed attempt.
    Failed,
}

/// An item on its way into the persistence worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Requested store operation.
    pub status: Status,
    /// The item it applies to.
    pub item: Item,
}

impl Envelope {
    /// A freshly parsed item to insert.
    pub fn new(item: Item) -> Self {
        Self {
            status: Status::New,
            item,
        }
    }

    /// An acknowledged item.
    pub fn sent(item: Item) -> Self {
        Self {
            status: Status::Sent,
            item,
        }
    }

    /// An item whose publish failed.
    pub fn failed(item: Item) -> Self {
        Self {
            status: Status::Failed,
            item,
        }
    }
}
