//! Live-state cache with LRU eviction and refcounted endurance.
//!
//! Evictable entries live in a bounded LRU; endured entries live in an
//! unbounded map protected from eviction, with one refcount per protector.
//! Eviction only ever touches evictable entries and fires the completion
//! callback for each victim.

use crate::types::StreamId;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::running::RunningState;

/// Invoked for every evicted entry, outside the cache lock.
pub type EvictCallback = Box<dyn Fn(StreamId, Arc<RunningState>) + Send + Sync>;

struct Endured {
    state: Arc<RunningState>,
    refs: usize,
}

struct CacheInner {
    evictable: LruCache<StreamId, Arc<RunningState>>,
    endured: HashMap<StreamId, Endured>,
}

/// Bounded cache of running states.
pub struct StateCache {
    inner: Mutex<CacheInner>,
    on_evict: EvictCallback,
}

impl StateCache {
    /// Create a cache holding at most `limit` evictable entries.
    pub fn new(limit: usize, on_evict: EvictCallback) -> Self {
        let limit = NonZeroUsize::new(limit.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                evictable: LruCache::new(limit),
                endured: HashMap::new(),
            }),
            on_evict,
        }
    }

    /// Look up an entry, refreshing its recency if evictable.
    pub fn get(&self, id: &StreamId) -> Option<Arc<RunningState>> {
        let mut inner = self.inner.lock();
        if let Some(endured) = inner.endured.get(id) {
            return Some(Arc::clone(&endured.state));
        }
        inner.evictable.get(id).cloned()
    }

    /// Atomic get-or-insert; returns the entry plus whether it was inserted.
    ///
    /// The single point where new running states enter the cache, so that
    /// concurrent loads never produce two instances for one stream.
    pub fn get_or_insert<F>(&self, id: StreamId, make: F) -> (Arc<RunningState>, bool)
    where
        F: FnOnce() -> Arc<RunningState>,
    {
        let (value, inserted, evicted) = {
            let mut inner = self.inner.lock();
            if let Some(endured) = inner.endured.get(&id) {
                (Arc::clone(&endured.state), false, None)
            } else if let Some(existing) = inner.evictable.get(&id) {
                (Arc::clone(existing), false, None)
            } else {
                let value = make();
                let evicted = push_evictable(&mut inner.evictable, id, Arc::clone(&value));
                (value, true, evicted)
            }
        };
        self.fire_eviction(evicted);
        (value, inserted)
    }

    /// Insert or refresh an evictable entry. An endured entry keeps its
    /// endured status; only its value is refreshed.
    pub fn set(&self, id: StreamId, state: Arc<RunningState>) {
        let evicted = {
            let mut inner = self.inner.lock();
            if let Some(endured) = inner.endured.get_mut(&id) {
                endured.state = state;
                None
            } else {
                push_evictable(&mut inner.evictable, id, state)
            }
        };
        self.fire_eviction(evicted);
    }

    /// Protect an entry from eviction. Repeated calls stack: each `endure`
    /// must be balanced by one `free`.
    pub fn endure(&self, id: StreamId, state: Arc<RunningState>) {
        let mut inner = self.inner.lock();
        if let Some(endured) = inner.endured.get_mut(&id) {
            endured.refs += 1;
            endured.state = state;
            return;
        }
        // Promote out of the evictable set if present.
        inner.evictable.pop(&id);
        inner.endured.insert(id, Endured { state, refs: 1 });
    }

    /// Release one endurance reference. When the last reference is released
    /// the entry demotes to evictable, which may evict the LRU entry.
    pub fn free(&self, id: StreamId) {
        let evicted = {
            let mut inner = self.inner.lock();
            let demoted = match inner.endured.get_mut(&id) {
                Some(endured) if endured.refs > 1 => {
                    endured.refs -= 1;
                    None
                }
                Some(_) => inner.endured.remove(&id).map(|e| e.state),
                None => None,
            };
            demoted.and_then(|state| push_evictable(&mut inner.evictable, id, state))
        };
        self.fire_eviction(evicted);
    }

    /// Remove an entry from both collections without firing the callback.
    pub fn delete(&self, id: &StreamId) {
        let mut inner = self.inner.lock();
        inner.endured.remove(id);
        inner.evictable.pop(id);
    }

    /// Snapshot of every cached entry.
    pub fn iterate(&self) -> Vec<Arc<RunningState>> {
        let inner = self.inner.lock();
        inner
            .endured
            .values()
            .map(|e| Arc::clone(&e.state))
            .chain(inner.evictable.iter().map(|(_, v)| Arc::clone(v)))
            .collect()
    }

    /// Remove and return every entry; used on shutdown.
    pub fn drain(&self) -> Vec<(StreamId, Arc<RunningState>)> {
        let mut inner = self.inner.lock();
        let mut out: Vec<_> = inner
            .endured
            .drain()
            .map(|(id, e)| (id, e.state))
            .collect();
        while let Some(entry) = inner.evictable.pop_lru() {
            out.push(entry);
        }
        out
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.endured.len() + inner.evictable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fire_eviction(&self, evicted: Option<(StreamId, Arc<RunningState>)>) {
        if let Some((id, state)) = evicted {
            (self.on_evict)(id, state);
        }
    }
}

/// Push into the LRU, translating its replace-returns-old-value behaviour
/// into a pure eviction signal.
fn push_evictable(
    lru: &mut LruCache<StreamId, Arc<RunningState>>,
    id: StreamId,
    state: Arc<RunningState>,
) -> Option<(StreamId, Arc<RunningState>)> {
    match lru.push(id, state) {
        Some((old_id, old_state)) if old_id != id => Some((old_id, old_state)),
        _ => None,
    }
}
