//! Shared, versioned cache of query results keyed by query identity + input.
//!
//! The snapshot load and every reconciliation step write through the same
//! [`QueryKey`]; readers receive `Arc` snapshots and never mutate in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use stagewatch_protocol::{ListPromotionsRequest, ListPromotionsResponse};
use tokio::sync::Notify;

pub const QUERY_LIST_PROMOTIONS: &str = "listPromotions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    Finite,
    Infinite,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey {
    pub cardinality: Cardinality,
    pub query: &'static str,
    pub input: ListPromotionsRequest,
}

impl QueryKey {
    pub fn list_promotions(input: ListPromotionsRequest) -> Self {
        Self {
            cardinality: Cardinality::Finite,
            query: QUERY_LIST_PROMOTIONS,
            input,
        }
    }
}

struct Entry<T> {
    value: Arc<T>,
    version: u64,
}

pub type PromotionListCache = QueryCache<ListPromotionsResponse>;

pub struct QueryCache<T> {
    entries: Mutex<HashMap<QueryKey, Entry<T>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl<T> Default for QueryCache<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl<T> QueryCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &QueryKey) -> Option<Arc<T>> {
        self.entries.lock().get(key).map(|e| Arc::clone(&e.value))
    }

    pub fn get_versioned(&self, key: &QueryKey) -> Option<(Arc<T>, u64)> {
        self.entries
            .lock()
            .get(key)
            .map(|e| (Arc::clone(&e.value), e.version))
    }

    /// Per-key version; 0 when nothing has been stored yet.
    pub fn version(&self, key: &QueryKey) -> u64 {
        self.entries.lock().get(key).map(|e| e.version).unwrap_or(0)
    }

    /// Sequence bumped on every write to any key.
    pub fn generation(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Replace the value under `key` and wake waiters. Returns the new version.
    pub fn set(&self, key: &QueryKey, value: T) -> u64 {
        self.set_if(key, value, || true).unwrap_or(0)
    }

    /// Like [`QueryCache::set`], but `admit` is evaluated under the map lock and
    /// a `false` answer leaves the entry untouched.
    pub fn set_if(&self, key: &QueryKey, value: T, admit: impl FnOnce() -> bool) -> Option<u64> {
        let version = {
            let mut map = self.entries.lock();
            if !admit() {
                return None;
            }
            let version = map.get(key).map(|e| e.version).unwrap_or(0) + 1;
            map.insert(
                key.clone(),
                Entry {
                    value: Arc::new(value),
                    version,
                },
            );
            version
        };
        self.seq.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Some(version)
    }

    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            self.seq.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the version under `key` advances beyond `last_seen` or `max_wait` elapses.
    /// Returns the latest observed version (unchanged on timeout).
    pub async fn wait_for_change(&self, key: &QueryKey, last_seen: u64, max_wait: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let current = self.version(key);
            if current > last_seen {
                return current;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.version(key);
                }
            }
        }
    }
}
