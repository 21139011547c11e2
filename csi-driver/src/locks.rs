//! Per-key lock registry
//!
//! Serializes lifecycle operations that target the same volume or snapshot
//! while leaving different keys fully concurrent. Each key maps to its own
//! async mutex. Entries are created on first use and dropped again once no
//! holder or waiter references them.
//!
//! Waiting is bounded: a caller that cannot get the lock within the registry
//! timeout gets [`LockError::Timeout`], which surfaces as a retryable
//! `Unavailable` to the CO. Dropping the acquiring future (request cancelled
//! or deadline hit) abandons the wait; dropping the guard releases the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::metrics::names::CSI_LOCK_WAIT_TIMEOUTS_TOTAL;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {scope} lock on {key}; retry later")]
    Timeout {
        scope: &'static str,
        key: String,
        waited: Duration,
    },
}

type Slots = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

struct Inner {
    scope: &'static str,
    timeout: Duration,
    slots: Slots,
}

/// Keyed mutex with bounded acquisition.
#[derive(Clone)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

/// Holds one key locked until dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyGuard {
    // Field order matters: the mutex guard must go before the slot reference
    // so the slot sees the final reference count when it cleans up.
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef,
}

/// Counted reference to a slot; removes the slot when it is the last user.
struct SlotRef {
    inner: Arc<Inner>,
    key: String,
    mutex: Arc<AsyncMutex<()>>,
}

impl SlotRef {
    fn checkout(inner: &Arc<Inner>, key: &str) -> Self {
        let mutex = inner
            .slots
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        Self {
            inner: Arc::clone(inner),
            key: key.to_string(),
            mutex,
        }
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        // Checked under the map lock so checkouts and removals cannot
        // interleave. Two references left means the map and this slot.
        let mut slots = self.inner.slots.lock();
        if Arc::strong_count(&self.mutex) == 2
            && slots
                .get(&self.key)
                .is_some_and(|m| Arc::ptr_eq(m, &self.mutex))
        {
            slots.remove(&self.key);
        }
    }
}

impl LockRegistry {
    /// Create a registry. `scope` names the key space in errors and logs.
    pub fn new(scope: &'static str, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope,
                timeout,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Lock `key`, waiting at most the registry timeout.
    pub async fn acquire(&self, key: &str) -> Result<KeyGuard, LockError> {
        let slot = SlotRef::checkout(&self.inner, key);
        let started = Instant::now();

        let wait = Arc::clone(&slot.mutex).lock_owned();
        match tokio::time::timeout(self.inner.timeout, wait).await {
            Ok(guard) => {
                debug!(
                    scope = self.inner.scope,
                    key,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired lock"
                );
                Ok(KeyGuard {
                    _guard: guard,
                    _slot: slot,
                })
            }
            Err(_) => {
                let waited = started.elapsed();
                warn!(scope = self.inner.scope, key, ?waited, "Lock wait timed out");
                counter!(CSI_LOCK_WAIT_TIMEOUTS_TOTAL, "scope" => self.inner.scope).increment(1);
                Err(LockError::Timeout {
                    scope: self.inner.scope,
                    key: key.to_string(),
                    waited,
                })
            }
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Separate key spaces for volumes, snapshots and locally mounted backing
/// shares.
///
/// A file-backed operation takes its volume lock before the backing share
/// lock, never the other way round.
#[derive(Clone)]
pub struct Locks {
    pub volumes: LockRegistry,
    pub snapshots: LockRegistry,
    pub backing_shares: LockRegistry,
}

impl Locks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            volumes: LockRegistry::new("volume", timeout),
            snapshots: LockRegistry::new("snapshot", timeout),
            backing_shares: LockRegistry::new("backing share", timeout),
        }
    }
}
