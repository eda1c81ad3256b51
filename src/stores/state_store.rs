//! Persistent storage of latest stream states.

use crate::error::{RepositoryError, Result};
use crate::types::{StreamId, StreamState};
use std::sync::Arc;

use super::kv::KvStore;

const STATE_PREFIX: &str = "states/";

/// Stores one MessagePack-encoded `StreamState` record per stream.
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &StreamId) -> String {
        format!("{STATE_PREFIX}{}", id.to_store_key())
    }

    /// Persist the latest state of a stream.
    pub fn save(&self, state: &StreamState) -> Result<()> {
        let id = state
            .stream_id()
            .ok_or_else(|| RepositoryError::InvalidCommit("state with empty log".into()))?;
        let encoded = rmp_serde::to_vec(state)?;
        self.kv.put(&Self::key(&id), &encoded)
    }

    /// Load a stream's persisted state, if any.
    pub fn load(&self, id: &StreamId) -> Result<Option<StreamState>> {
        match self.kv.get(&Self::key(id))? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a stream's persisted state.
    pub fn remove(&self, id: &StreamId) -> Result<()> {
        self.kv.del(&Self::key(id))
    }

    /// Page through stored stream IDs in key order, starting strictly after
    /// `cursor`.
    pub fn list_stored_stream_ids(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let ids = self
            .kv
            .keys(STATE_PREFIX)?
            .into_iter()
            .map(|k| k[STATE_PREFIX.len()..].to_string())
            .filter(|id| cursor.map_or(true, |c| id.as_str() > c))
            .take(limit)
            .collect();
        Ok(ids)
    }
}
