//! The key-addressed object store.
//!
//! One store lives for the lifetime of the node process and holds every
//! value computed or put by callers, so results can be reused across calls
//! without re-transmission. Pinned entries survive bulk clears; per-call
//! scratch results are reclaimed in one sweep.

use std::collections::HashMap;
use std::sync::RwLock;

use outpost_codec::Value;
use tracing::debug;

/// One stored entry: the owned value plus its pin flag.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub value: Value,
    pub pinned: bool,
}

/// A key-addressed mapping from string key to an owned value.
///
/// Reads (`get`, `list_keys`) run concurrently; mutations (`put`, `clear`)
/// are serialized. The store exclusively owns each value until it is
/// explicitly removed or the process terminates.
#[derive(Default)]
pub struct ObjectStore {
    entries: RwLock<HashMap<String, StoredObject>>,
}

impl ObjectStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value at `key`, overwriting any existing entry.
    ///
    /// Puts are best-effort accepted: they block only on lock acquisition,
    /// never on computation.
    pub fn put(&self, key: impl Into<String>, value: Value) {
        self.insert(key.into(), value, false);
    }

    /// Store a pinned value at `key`. Pinned entries are exempt from bulk
    /// clearing but are still removed when named explicitly.
    pub fn put_pinned(&self, key: impl Into<String>, value: Value) {
        self.insert(key.into(), value, true);
    }

    fn insert(&self, key: String, value: Value, pinned: bool) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(key, StoredObject { value, pinned });
    }

    /// Get the value at `key`, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().unwrap();
        entries.get(key).map(|obj| obj.value.clone())
    }

    /// Whether `key` is currently stored.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }

    /// Remove exactly the named keys, regardless of pin state.
    ///
    /// Clearing an absent key is a no-op, not an error.
    pub fn clear(&self, keys: &[String]) {
        let mut entries = self.entries.write().unwrap();
        for key in keys {
            entries.remove(key);
        }
        debug!(count = keys.len(), "cleared named store entries");
    }

    /// Remove every unpinned entry.
    pub fn clear_unpinned(&self) {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, obj| obj.pinned);
        debug!(removed = before - entries.len(), "swept unpinned store entries");
    }

    /// All currently stored keys.
    pub fn list_keys(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }

    /// Keys of pinned entries.
    pub fn pinned_keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .filter(|(_, obj)| obj.pinned)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
