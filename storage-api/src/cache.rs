//! Time-boxed memoization for read-mostly API queries.
//!
//! The cache is owned by whoever constructs the [`crate::ApiClient`] and is
//! passed in, so tests and multiple clients can share or isolate it.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Key for the cluster free-capacity figure.
pub const KEY_FREE_CAPACITY: &str = "cluster/free-capacity";
/// Key for the objective catalog.
pub const KEY_OBJECTIVES: &str = "objectives";

/// Values the API client memoizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Capacity(u64),
    Objectives(Vec<String>),
}

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// Bounded map whose entries expire a fixed time after insertion.
pub struct TtlCache<V, K = String> {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<V: Clone, K: Eq + Hash + Clone> TtlCache<V, K> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the value if present and fresh. Expired entries are dropped.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or refresh an entry, evicting expired and then oldest entries
    /// when the cache is full.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.inserted.elapsed() < ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: std::borrow::Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
