//! Durability flags and state records for pinned streams.

use crate::error::{RepositoryError, Result};
use crate::types::{StreamId, StreamState};
use std::sync::Arc;

use super::kv::KvStore;
use super::state_store::StateStore;

const PIN_PREFIX: &str = "pins/";

/// Tracks which streams are pinned and owns their persisted states.
pub struct PinStore {
    kv: Arc<dyn KvStore>,
    state_store: StateStore,
}

impl PinStore {
    /// Open a pin store over a key-value backend.
    pub fn open(kv: Arc<dyn KvStore>) -> Self {
        let state_store = StateStore::new(Arc::clone(&kv));
        Self { kv, state_store }
    }

    fn key(id: &StreamId) -> String {
        format!("{PIN_PREFIX}{}", id.to_store_key())
    }

    /// Pin a stream, persisting its current state. A stream already pinned
    /// is left untouched unless `force` is set.
    pub fn add(&self, state: &StreamState, force: bool) -> Result<()> {
        let id = state
            .stream_id()
            .ok_or_else(|| RepositoryError::InvalidCommit("state with empty log".into()))?;
        if !force && self.is_pinned(&id)? {
            return Ok(());
        }
        self.state_store.save(state)?;
        self.kv.put(&Self::key(&id), &[])
    }

    /// Unpin a stream and discard its persisted state.
    pub fn rm(&self, id: &StreamId) -> Result<()> {
        self.kv.del(&Self::key(id))?;
        self.state_store.remove(id)
    }

    /// List pinned stream IDs; with `stream_id` given, at most that one.
    pub fn ls(&self, stream_id: Option<&StreamId>) -> Result<Vec<String>> {
        match stream_id {
            Some(id) => {
                if self.is_pinned(id)? {
                    Ok(vec![id.to_store_key()])
                } else {
                    Ok(Vec::new())
                }
            }
            None => Ok(self
                .kv
                .keys(PIN_PREFIX)?
                .into_iter()
                .map(|k| k[PIN_PREFIX.len()..].to_string())
                .collect()),
        }
    }

    pub fn is_pinned(&self, id: &StreamId) -> Result<bool> {
        Ok(self.kv.get(&Self::key(id))?.is_some())
    }

    /// The state records behind the pins.
    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    /// Release the store. Idempotent; the backend owns actual file handles.
    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}
