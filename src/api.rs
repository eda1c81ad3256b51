//! Interfaces consumed from external collaborators.
//!
//! The repository mediates local state only; fetching commits, computing
//! next-states, anchoring, picking winners between divergent logs, and
//! indexing all live behind these seams.

use crate::error::Result;
use crate::types::{Cid, Commit, StreamId, StreamState, StreamType};
use crossbeam_channel::Receiver;

/// Network access for commits and tips.
///
/// An unavailable network maps to `None`, never to an error; the repository
/// treats missing data as "nothing known remotely".
pub trait Dispatcher: Send + Sync {
    /// Fetch a commit by CID.
    fn fetch_commit(&self, cid: &Cid) -> Option<Commit>;

    /// The network's current tip for a stream, if any peer knows one.
    fn fetch_tip(&self, stream_id: &StreamId) -> Option<Cid>;

    /// Publish a new tip to the network.
    fn publish_tip(&self, stream_id: &StreamId, tip: &Cid);
}

/// One commit as presented to a handler.
pub struct CommitData<'a> {
    pub commit: &'a Commit,
    /// Skip capability-expiry validation inside the handler. Set during
    /// genesis loads from the network and during historical replays, where
    /// anchor timestamps arriving later can prove a capability was valid
    /// when used; the caller checks the final state instead.
    pub disable_timecheck: bool,
}

/// Per-stream-type commit application.
///
/// Pure function of its inputs: no I/O, no clocks beyond the timecheck flag.
pub trait Handler: Send + Sync {
    /// The stream type this handler serves.
    fn stream_type(&self) -> StreamType;

    /// Compute the next state from the previous state plus one commit.
    /// Genesis application receives `prev = None`.
    fn apply_commit(&self, data: &CommitData<'_>, prev: Option<&StreamState>)
        -> Result<StreamState>;
}

/// Progress of one anchor request.
#[derive(Clone, Debug)]
pub enum AnchorEvent {
    Pending,
    Processing,
    /// The service produced an anchor commit for the requested tip.
    Completed { commit: Commit },
    Failed { reason: String },
}

/// External timestamping service.
pub trait AnchorService: Send + Sync {
    /// Ask for the stream's tip to be anchored; events arrive on the
    /// returned channel until a terminal `Completed`/`Failed`.
    fn request_anchor(&self, state: &StreamState) -> Receiver<AnchorEvent>;

    /// Re-attach to a previously persisted request for `commit`.
    fn confirm(&self, state: &StreamState, commit: &Cid) -> Receiver<AnchorEvent>;

    /// Ledger chains this service can anchor to.
    fn supported_chains(&self) -> Vec<String>;
}

/// Outcome of conflict resolution between two competing logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    Current,
    Candidate,
}

/// Picks the canonical state when a candidate log does not linearly extend
/// the current one. Must be deterministic and total, including over
/// equal-length logs.
pub trait ConflictResolution: Send + Sync {
    fn resolve(&self, current: &StreamState, candidate: &StreamState) -> Winner;
}

/// Default resolution: the longer log wins; equal lengths break by tip-hash
/// comparison, so any two nodes pick the same winner.
#[derive(Default)]
pub struct LogLengthResolution;

impl ConflictResolution for LogLengthResolution {
    fn resolve(&self, current: &StreamState, candidate: &StreamState) -> Winner {
        match candidate.log.len().cmp(&current.log.len()) {
            std::cmp::Ordering::Greater => Winner::Candidate,
            std::cmp::Ordering::Less => Winner::Current,
            std::cmp::Ordering::Equal => match (candidate.tip(), current.tip()) {
                (Some(cand), Some(cur)) if cand < cur => Winner::Candidate,
                _ => Winner::Current,
            },
        }
    }
}

/// Index of model-tagged streams.
pub trait IndexingApi: Send + Sync {
    fn init(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Whether streams tagged with `model` should be indexed.
    fn should_index_stream(&self, model: &str) -> bool;

    /// Record the latest state of an indexed stream.
    fn index_stream(&self, state: &StreamState) -> Result<()>;
}
