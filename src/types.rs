//! Core value types for the stream repository.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::RepositoryError;

/// Content identifier: SHA-256 over a commit's canonical bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid(pub [u8; 32]);

impl Cid {
    /// Compute a CID from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Cid(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Cid(arr))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Handler discriminator for a stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct StreamType(pub u8);

impl fmt::Debug for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamType({})", self.0)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a stream: the genesis commit's CID plus a type tag.
///
/// Comparable by value; two creates with content-identical genesis commits
/// resolve to the same stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub stream_type: StreamType,
    pub genesis: Cid,
}

impl StreamId {
    pub fn new(stream_type: StreamType, genesis: Cid) -> Self {
        Self {
            stream_type,
            genesis,
        }
    }

    /// Canonical string form, used as a store key.
    pub fn to_store_key(&self) -> String {
        format!("{}-{}", self.stream_type.0, self.genesis.to_hex())
    }

    /// Parse the canonical string form.
    pub fn from_store_key(s: &str) -> Result<Self, RepositoryError> {
        let (type_part, cid_part) = s
            .split_once('-')
            .ok_or_else(|| RepositoryError::InvalidFormat(format!("bad stream id: {s}")))?;
        let stream_type = type_part
            .parse::<u8>()
            .map_err(|_| RepositoryError::InvalidFormat(format!("bad stream type: {s}")))?;
        let genesis = Cid::from_hex(cid_part)
            .map_err(|_| RepositoryError::InvalidFormat(format!("bad stream cid: {s}")))?;
        Ok(Self {
            stream_type: StreamType(stream_type),
            genesis,
        })
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamId({}-{}...)",
            self.stream_type.0,
            &self.genesis.to_hex()[..8]
        )
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

/// Addresses a historical snapshot: a stream plus a commit within its log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CommitId {
    pub stream: StreamId,
    pub commit: Cid,
}

impl CommitId {
    pub fn new(stream: StreamId, commit: Cid) -> Self {
        Self { stream, commit }
    }
}

/// Commit type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitType {
    Genesis,
    Signed,
    Anchor,
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs * 1_000_000)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque content-addressed record in a stream's log.
///
/// The repository reads only the structural fields (`cid`, `prev`,
/// `commit_type`, anchor `timestamp`, `capability_expiry`); the payload's
/// semantics belong entirely to the stream's handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub cid: Cid,
    pub commit_type: CommitType,
    /// Link to the previous commit in the log (None for genesis).
    pub prev: Option<Cid>,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Proof timestamp (anchor commits only).
    pub timestamp: Option<Timestamp>,
    /// Expiry of the capability that authorised this commit, if any.
    pub capability_expiry: Option<Timestamp>,
}

impl Commit {
    /// Build a genesis commit; the CID is derived from the content.
    pub fn genesis(payload: Vec<u8>) -> Self {
        Self::finalise(CommitType::Genesis, None, payload, None, None)
    }

    /// Build a signed update commit on top of `prev`.
    pub fn signed(prev: Cid, payload: Vec<u8>) -> Self {
        Self::finalise(CommitType::Signed, Some(prev), payload, None, None)
    }

    /// Build an anchor commit carrying a proof timestamp.
    pub fn anchor(prev: Cid, timestamp: Timestamp) -> Self {
        Self::finalise(
            CommitType::Anchor,
            Some(prev),
            Vec::new(),
            Some(timestamp),
            None,
        )
    }

    /// Attach a capability expiry; the CID is recomputed since the
    /// capability is part of the signed content.
    pub fn with_capability_expiry(self, expiry: Timestamp) -> Self {
        Self::finalise(
            self.commit_type,
            self.prev,
            self.payload,
            self.timestamp,
            Some(expiry),
        )
    }

    fn finalise(
        commit_type: CommitType,
        prev: Option<Cid>,
        payload: Vec<u8>,
        timestamp: Option<Timestamp>,
        capability_expiry: Option<Timestamp>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([match commit_type {
            CommitType::Genesis => 0u8,
            CommitType::Signed => 1,
            CommitType::Anchor => 2,
        }]);
        if let Some(prev) = &prev {
            hasher.update(prev.0);
        }
        hasher.update(&payload);
        if let Some(ts) = &timestamp {
            hasher.update(ts.0.to_le_bytes());
        }
        if let Some(exp) = &capability_expiry {
            hasher.update(exp.0.to_le_bytes());
        }
        Self {
            cid: Cid(hasher.finalize().into()),
            commit_type,
            prev,
            payload,
            timestamp,
            capability_expiry,
        }
    }
}

/// One entry of a stream's materialised log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub cid: Cid,
    pub commit_type: CommitType,
    /// Anchor proof timestamp, once anchored.
    pub timestamp: Option<Timestamp>,
    /// Capability expiry carried by the commit, if any.
    pub capability_expiry: Option<Timestamp>,
}

impl From<&Commit> for LogEntry {
    fn from(commit: &Commit) -> Self {
        Self {
            cid: commit.cid,
            commit_type: commit.commit_type,
            timestamp: commit.timestamp,
            capability_expiry: commit.capability_expiry,
        }
    }
}

/// Where a stream stands in the anchoring pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AnchorStatus {
    #[default]
    NotRequested,
    Pending,
    Processing,
    Anchored,
    Failed,
}

/// Identities and indexing tag attached to a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamMetadata {
    /// Identities authorised to author commits.
    pub controllers: Vec<String>,
    /// Schema group tag; presence makes the stream a candidate for indexing.
    pub model: Option<String>,
}

/// Deterministic projection of a stream's commit log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub stream_type: StreamType,
    /// Ordered log entries, genesis first.
    pub log: Vec<LogEntry>,
    /// Current materialised content (opaque to the repository).
    pub content: serde_json::Value,
    pub metadata: StreamMetadata,
    pub anchor_status: AnchorStatus,
}

impl StreamState {
    /// CID of the most recently applied commit.
    pub fn tip(&self) -> Option<Cid> {
        self.log.last().map(|e| e.cid)
    }

    /// Identifier of the stream this state belongs to.
    pub fn stream_id(&self) -> Option<StreamId> {
        self.log
            .first()
            .map(|genesis| StreamId::new(self.stream_type, genesis.cid))
    }
}

/// How `load` consults the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Return the cached/local state when present; sync only on a miss.
    #[default]
    PreferCache,
    /// Always fetch the latest tip from the network, hinting with local state.
    SyncAlways,
    /// Never touch the network beyond a genesis fetch on a full miss.
    NeverSync,
    /// Like `PreferCache`; callers retry with a sync when handler errors occur.
    SyncOnError,
}

impl TryFrom<u8> for SyncMode {
    type Error = RepositoryError;

    fn try_from(value: u8) -> Result<Self, RepositoryError> {
        match value {
            0 => Ok(SyncMode::PreferCache),
            1 => Ok(SyncMode::SyncAlways),
            2 => Ok(SyncMode::NeverSync),
            3 => Ok(SyncMode::SyncOnError),
            other => Err(RepositoryError::InvalidSyncOption(other)),
        }
    }
}

/// Options for load operations.
#[derive(Clone, Debug, Default)]
pub struct LoadOpts {
    pub sync: SyncMode,
    /// Bound on network sync; falls back to the repository default.
    pub sync_timeout: Option<Duration>,
    /// Defer capability-expiry checks to the caller.
    pub skip_capability_checks: bool,
}

impl LoadOpts {
    pub fn with_sync(sync: SyncMode) -> Self {
        Self {
            sync,
            ..Default::default()
        }
    }
}

/// Options for create/update operations.
#[derive(Clone, Debug)]
pub struct WriteOpts {
    /// Request an anchor for the new tip.
    pub anchor: bool,
    /// Publish the new tip to the network.
    pub publish: bool,
    /// Pin request; only honoured at stream creation.
    pub pin: Option<bool>,
}

impl Default for WriteOpts {
    fn default() -> Self {
        Self {
            anchor: true,
            publish: true,
            pin: None,
        }
    }
}

/// How a write reached the repository; drives the pin policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    Create,
    Update,
    Load,
}

/// Durable record of an outstanding anchor request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorRequestRecord {
    pub stream_id: StreamId,
    pub commit: Cid,
    pub created_at: Timestamp,
}
