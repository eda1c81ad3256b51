//! Observable container for one stream's live state.
//!
//! A `RunningState` wraps the current `StreamState` and broadcasts every
//! replacement to its subscribers over bounded channels. Slow subscribers
//! are dropped rather than blocking the emitter. Once completed, no further
//! emissions occur.

use crate::types::{Cid, StreamId, StreamState};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Buffered emissions per subscriber before it is dropped as too slow.
const SUBSCRIBER_BUFFER: usize = 1000;

struct Inner {
    state: StreamState,
    completed: bool,
    subscribers: HashMap<u64, Sender<StreamState>>,
}

/// Live wrapper around a stream's current state.
pub struct RunningState {
    id: StreamId,
    inner: Mutex<Inner>,
    pinned: AtomicBool,
    next_subscriber_id: AtomicU64,
}

impl RunningState {
    pub fn new(id: StreamId, state: StreamState, pinned: bool) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner {
                state,
                completed: false,
                subscribers: HashMap::new(),
            }),
            pinned: AtomicBool::new(pinned),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Snapshot of the current state.
    pub fn current(&self) -> StreamState {
        self.inner.lock().state.clone()
    }

    /// CID of the latest applied commit.
    pub fn tip(&self) -> Option<Cid> {
        self.inner.lock().state.tip()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::SeqCst);
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().completed
    }

    /// Replace the current state and notify subscribers.
    ///
    /// Returns false without emitting when the container has completed or
    /// when `new_state` equals the current state. Whether `new_state`
    /// legitimately extends or replaces the log is the caller's concern;
    /// conflict resolution runs before states reach this point.
    pub fn next(&self, new_state: StreamState) -> bool {
        let mut inner = self.inner.lock();
        if inner.completed || inner.state == new_state {
            return false;
        }
        inner.state = new_state.clone();

        // Emit under the lock so concurrent replacements reach every
        // subscriber in order. try_send never blocks; a full buffer drops
        // the subscriber, as does a disconnected receiver.
        let mut dead = Vec::new();
        for (sub_id, sender) in inner.subscribers.iter() {
            if sender.try_send(new_state.clone()).is_err() {
                dead.push(*sub_id);
            }
        }
        for sub_id in dead {
            inner.subscribers.remove(&sub_id);
        }
        true
    }

    /// Subscribe to state replacements. The current state is delivered
    /// immediately, followed by every subsequent emission. Dropping the
    /// subscription unregisters the observer.
    pub fn subscribe(self: &Arc<Self>) -> StateSubscription {
        let sub_id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(SUBSCRIBER_BUFFER);

        let mut inner = self.inner.lock();
        let _ = sender.try_send(inner.state.clone());
        if !inner.completed {
            inner.subscribers.insert(sub_id, sender);
        }
        drop(inner);

        StateSubscription {
            state: Arc::downgrade(self),
            sub_id,
            receiver,
        }
    }

    /// Number of live observers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Terminal: emits nothing further and disconnects all subscribers.
    /// Idempotent.
    pub fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.completed = true;
        inner.subscribers.clear();
    }

    fn unsubscribe(&self, sub_id: u64) {
        self.inner.lock().subscribers.remove(&sub_id);
    }
}

/// Handle on a subscription to a running state.
pub struct StateSubscription {
    state: Weak<RunningState>,
    sub_id: u64,
    receiver: Receiver<StreamState>,
}

impl StateSubscription {
    /// Receive the next emission (blocking). Errors once the running state
    /// completes and the buffer drains.
    pub fn recv(&self) -> Result<StreamState, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Receive without blocking.
    pub fn try_recv(&self) -> Result<StreamState, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with a timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<StreamState, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.unsubscribe(self.sub_id);
        }
    }
}
