//! Durable anchor-request records.
//!
//! An outstanding anchor request is written here before the anchor service
//! is asked, so the request survives restarts and can be re-confirmed when
//! the stream is next loaded.

use crate::error::Result;
use crate::types::{AnchorRequestRecord, StreamId};
use std::sync::Arc;

use super::kv::KvStore;

const ANCHOR_PREFIX: &str = "anchors/";

pub struct AnchorRequestStore {
    kv: Arc<dyn KvStore>,
}

impl AnchorRequestStore {
    pub fn open(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(id: &StreamId) -> String {
        format!("{ANCHOR_PREFIX}{}", id.to_store_key())
    }

    pub fn save(&self, id: &StreamId, record: &AnchorRequestRecord) -> Result<()> {
        let encoded = rmp_serde::to_vec(record)?;
        self.kv.put(&Self::key(id), &encoded)
    }

    pub fn load(&self, id: &StreamId) -> Result<Option<AnchorRequestRecord>> {
        match self.kv.get(&Self::key(id))? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &StreamId) -> Result<()> {
        self.kv.del(&Self::key(id))
    }
}
