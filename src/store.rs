//! Bounded store of per-bucket throttling state.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::bucketing::BucketKey;
use crate::clock::Clock;
use crate::state::ThrottlingState;

struct Entry {
    state: Arc<ThrottlingState>,
    last_access: Instant,
}

/// Maps bucket keys to their [`ThrottlingState`], bounded two ways: a maximum
/// size enforced by LRU eviction, and an idle expiry checked lazily on
/// access. Eviction is silent; an evicted key starts fresh with full buckets
/// on its next appearance.
pub struct StateStore {
    entries: Mutex<LruCache<BucketKey, Entry>>,
    expire_after: Duration,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(max_size: usize, expire_after: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            expire_after,
            clock,
        }
    }

    /// Looks up existing state without creating any. Touches the entry's
    /// recency; an entry idle for longer than the expiry is dropped and
    /// reported as absent.
    pub fn get(&self, key: &BucketKey) -> Option<Arc<ThrottlingState>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                if now.duration_since(entry.last_access) <= self.expire_after {
                    entry.last_access = now;
                    return Some(entry.state.clone());
                }
            }
            None => return None,
        }
        entries.pop(key);
        None
    }

    /// Returns the state for `key`, creating it through `create` if the key
    /// is absent or its entry has idled out.
    pub fn get_or_create(
        &self,
        key: &BucketKey,
        create: impl FnOnce() -> Arc<ThrottlingState>,
    ) -> Arc<ThrottlingState> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            if now.duration_since(entry.last_access) <= self.expire_after {
                entry.last_access = now;
                return entry.state.clone();
            }
        }
        let state = create();
        entries.put(
            key.clone(),
            Entry {
                state: state.clone(),
                last_access: now,
            },
        );
        state
    }

    /// Number of tracked buckets, including idle entries not yet collected.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
