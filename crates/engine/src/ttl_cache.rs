//! Time-to-live cache: entries expire after a fixed age, not on invalidation.

use std::hash::Hash;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// Thread-safe TTL map. Expired entries are treated as absent and are
/// replaced on the next insert.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<FxHashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.inserted.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.write().insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted.elapsed() < ttl);
        before - entries.len()
    }

    /// Entry count, expired entries included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
