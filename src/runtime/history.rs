//! Bounded message history and the context store
//!
//! Each followed source gets either one ring buffer or one ring buffer per
//! slot. Entries are kept newest first and stamped with the round they arrived
//! in (`time-rcvd`) and, when a slot applies, the slot (`slot-rcvd`).

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::{Map, Value, json};

/// Default ring buffer capacity
pub const DEFAULT_CAPACITY: usize = 100;

/// Key stamped with the round a message was recorded in
pub const TIME_KEY: &str = "time-rcvd";

/// Key stamped with the slot a message arrived on
pub const SLOT_KEY: &str = "slot-rcvd";

/// Key wrapping payloads that are not JSON objects
pub const DATA_KEY: &str = "data";

/// Newest-first ring buffer
#[derive(Debug, Clone, PartialEq)]
pub struct Ring {
    entries: VecDeque<Value>,
    capacity: usize,
}

impl Ring {
    /// Create an empty ring holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepend an entry, evicting the oldest when full
    pub fn push(&mut self, entry: Value) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Most recent entry
    pub fn latest(&self) -> Option<&Value> {
        self.entries.front()
    }

    /// Entry `index` steps back from the newest
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.entries.get(index)
    }

    /// Entries, newest first
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Recorded history of one source
#[derive(Debug, Clone, PartialEq)]
pub enum History {
    /// All topics share one buffer
    Single(Ring),
    /// One buffer per declared slot
    Slotted(BTreeMap<String, Ring>),
}

impl History {
    fn new(slots: Option<&[String]>, capacity: usize) -> Self {
        match slots {
            Some(slots) if !slots.is_empty() => History::Slotted(
                slots
                    .iter()
                    .map(|slot| (slot.clone(), Ring::new(capacity)))
                    .collect(),
            ),
            _ => History::Single(Ring::new(capacity)),
        }
    }

    /// Buffer for `slot` (the single buffer ignores the slot)
    pub fn buffer(&self, slot: Option<&str>) -> Option<&Ring> {
        match self {
            History::Single(ring) => Some(ring),
            History::Slotted(rings) => slot.and_then(|slot| rings.get(slot)),
        }
    }

    fn buffer_mut(&mut self, slot: Option<&str>) -> Option<&mut Ring> {
        match self {
            History::Single(ring) => Some(ring),
            History::Slotted(rings) => slot.and_then(|slot| rings.get_mut(slot)),
        }
    }
}

/// Per-area context: message history plus free-form context values
///
/// Only the owning area's loop writes here.
#[derive(Debug, Clone, Default)]
pub struct Context {
    history: HashMap<String, History>,
    values: Map<String, Value>,
}

impl Context {
    /// Create a context seeded with initial values
    pub fn new(values: Map<String, Value>) -> Self {
        Self {
            history: HashMap::new(),
            values,
        }
    }

    /// Allocate history for `source`
    ///
    /// A source that already has history keeps it.
    pub fn init(&mut self, source: &str, slots: Option<&[String]>, capacity: usize) {
        self.history
            .entry(source.to_string())
            .or_insert_with(|| History::new(slots, capacity));
    }

    /// Whether `source` has history allocated
    pub fn is_tracking(&self, source: &str) -> bool {
        self.history.contains_key(source)
    }

    /// Record a message from `source`, stamped with the round and slot
    ///
    /// Returns false when there is no buffer for it.
    pub fn imprint(&mut self, source: &str, message: Value, slot: Option<&str>, time: u64) -> bool {
        let Some(history) = self.history.get_mut(source) else {
            return false;
        };
        let Some(ring) = history.buffer_mut(slot) else {
            tracing::warn!(
                "No history buffer for slot {:?} of '{}'; message not recorded",
                slot,
                source
            );
            return false;
        };

        ring.push(stamp(message, time, slot));
        true
    }

    /// History of `source`
    pub fn history(&self, source: &str) -> Option<&History> {
        self.history.get(source)
    }

    /// Buffer of `source` for `slot`
    pub fn buffer(&self, source: &str, slot: Option<&str>) -> Option<&Ring> {
        self.history.get(source).and_then(|history| history.buffer(slot))
    }

    /// Newest entry of `source` for `slot`
    pub fn latest(&self, source: &str, slot: Option<&str>) -> Option<&Value> {
        self.buffer(source, slot).and_then(Ring::latest)
    }

    /// Followed sources, sorted
    pub fn sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = self.history.keys().map(String::as_str).collect();
        sources.sort_unstable();
        sources
    }

    /// Context value
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Set a context value, returning the previous one
    pub fn set_value(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// All context values
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

fn stamp(message: Value, time: u64, slot: Option<&str>) -> Value {
    let mut record = match message {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert(DATA_KEY.to_string(), other);
            map
        }
    };

    record.insert(TIME_KEY.to_string(), json!(time));
    if let Some(slot) = slot {
        record.insert(SLOT_KEY.to_string(), json!(slot));
    }
    Value::Object(record)
}
