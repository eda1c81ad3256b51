//! Commit application, synchronisation, and anchor coordination.
//!
//! The manager owns the algorithm that turns commits into state transitions:
//! loading the running state, asking the type's handler for the candidate
//! next state, resolving conflicts when a commit does not linearly extend
//! the log, emitting the winner, and persisting pinned streams. It also
//! drives network sync (bounded by a timeout, never raising on network
//! failure) and the anchor request/confirm event loops.

use crate::api::{
    AnchorEvent, AnchorService, CommitData, ConflictResolution, Dispatcher, Handler, Winner,
};
use crate::error::{RepositoryError, Result};
use crate::queue::ExecutionQueue;
use crate::stores::{AnchorRequestStore, PinStore};
use crate::types::{
    AnchorRequestRecord, AnchorStatus, Cid, Commit, CommitId, CommitType, LogEntry, StreamId,
    StreamState, StreamType, Timestamp,
};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::running::RunningState;

/// Callback into the repository that materialises a stream's running state
/// without syncing (memory, then local store, then network genesis).
pub type LoadFn = Box<dyn Fn(StreamId) -> Result<Arc<RunningState>> + Send + Sync>;

/// Applies commits, performs sync, resolves conflicts, and drives anchor
/// requests. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    dispatcher: Arc<dyn Dispatcher>,
    handlers: HashMap<StreamType, Arc<dyn Handler>>,
    conflict_resolution: Arc<dyn ConflictResolution>,
    anchor_service: Arc<dyn AnchorService>,
    pin_store: Arc<PinStore>,
    anchor_requests: Arc<AnchorRequestStore>,
    execution_q: Arc<ExecutionQueue>,
    load_fn: LoadFn,
    /// Pinned streams synced during this process lifetime.
    synced_pinned: Mutex<HashSet<StreamId>>,
    /// In-flight sync per stream; an abandoned attempt stays here until its
    /// worker finishes, so later syncs observe it instead of stacking.
    active_syncs: Mutex<HashMap<StreamId, Receiver<()>>>,
}

impl StateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        handlers: Vec<Arc<dyn Handler>>,
        conflict_resolution: Arc<dyn ConflictResolution>,
        anchor_service: Arc<dyn AnchorService>,
        pin_store: Arc<PinStore>,
        anchor_requests: Arc<AnchorRequestStore>,
        execution_q: Arc<ExecutionQueue>,
        load_fn: LoadFn,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.stream_type(), h))
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                dispatcher,
                handlers,
                conflict_resolution,
                anchor_service,
                pin_store,
                anchor_requests,
                execution_q,
                load_fn,
                synced_pinned: Mutex::new(HashSet::new()),
                active_syncs: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn handler_for(&self, stream_type: StreamType) -> Result<Arc<dyn Handler>> {
        self.inner
            .handlers
            .get(&stream_type)
            .cloned()
            .ok_or(RepositoryError::NoHandler(stream_type.0))
    }

    /// Apply the genesis commit of a freshly fetched stream. Capability
    /// timechecks are deferred: an anchor arriving later can prove the
    /// capability was valid when used.
    pub fn state_from_genesis(
        &self,
        stream_type: StreamType,
        commit: &Commit,
    ) -> Result<StreamState> {
        let handler = self.handler_for(stream_type)?;
        handler.apply_commit(
            &CommitData {
                commit,
                disable_timecheck: true,
            },
            None,
        )
    }

    // --- Commit application ---

    /// Apply one commit to a stream. Must run while holding the stream's
    /// execution-queue slot; the repository enqueues this for its callers.
    pub fn apply_commit(&self, stream_id: StreamId, commit: Commit) -> Result<Arc<RunningState>> {
        let state = (self.inner.load_fn)(stream_id)?;
        let current = state.current();

        if current.log.iter().any(|e| e.cid == commit.cid) {
            // Already part of the canonical log.
            return Ok(state);
        }

        let candidate = if commit.prev == current.tip() {
            let handler = self.handler_for(current.stream_type)?;
            handler.apply_commit(
                &CommitData {
                    commit: &commit,
                    disable_timecheck: false,
                },
                Some(&current),
            )?
        } else {
            let requested = commit.cid;
            self.rebuild_candidate(stream_id, &current, commit, requested)?
        };

        self.resolve_and_emit(&state, current, candidate)?;
        Ok(state)
    }

    /// Emit whichever of current/candidate wins, persisting pinned streams.
    fn resolve_and_emit(
        &self,
        state: &Arc<RunningState>,
        current: StreamState,
        candidate: StreamState,
    ) -> Result<()> {
        let winner = if log_extends(&current.log, &candidate.log) {
            candidate
        } else {
            match self.inner.conflict_resolution.resolve(&current, &candidate) {
                Winner::Candidate => candidate,
                Winner::Current => return Ok(()),
            }
        };
        if state.next(winner) {
            self.save_if_pinned(state)?;
        }
        Ok(())
    }

    /// Rebuild a candidate state for a commit that does not sit on the
    /// current tip: walk its `prev` links back to the divergence point (or
    /// genesis), refetch the shared prefix, and replay the whole log.
    fn rebuild_candidate(
        &self,
        stream_id: StreamId,
        current: &StreamState,
        head: Commit,
        requested: Cid,
    ) -> Result<StreamState> {
        let known: HashMap<Cid, usize> = current
            .log
            .iter()
            .enumerate()
            .map(|(i, e)| (e.cid, i))
            .collect();

        let mut branch: Vec<Commit> = Vec::new();
        let mut cursor = head;
        let divergence_idx = loop {
            let prev = cursor.prev;
            branch.push(cursor);
            match prev {
                None => {
                    // Walked to a genesis; it must be this stream's genesis.
                    if branch.last().map(|c| c.cid) != Some(stream_id.genesis) {
                        return Err(RepositoryError::CommitNotInLog {
                            stream: stream_id,
                            commit: requested,
                        });
                    }
                    break None;
                }
                Some(p) => {
                    if let Some(&idx) = known.get(&p) {
                        break Some(idx);
                    }
                    match self.inner.dispatcher.fetch_commit(&p) {
                        Some(c) => cursor = c,
                        None => {
                            return Err(RepositoryError::CommitNotInLog {
                                stream: stream_id,
                                commit: p,
                            })
                        }
                    }
                }
            }
        };
        branch.reverse();

        let mut commits = match divergence_idx {
            Some(idx) => self.fetch_log(stream_id, &current.log[..=idx])?,
            None => Vec::new(),
        };
        commits.extend(branch);
        self.replay(current.stream_type, &commits)
    }

    fn fetch_log(&self, stream_id: StreamId, entries: &[LogEntry]) -> Result<Vec<Commit>> {
        entries
            .iter()
            .map(|e| {
                self.inner
                    .dispatcher
                    .fetch_commit(&e.cid)
                    .ok_or(RepositoryError::CommitNotInLog {
                        stream: stream_id,
                        commit: e.cid,
                    })
            })
            .collect()
    }

    /// Replay a full commit log from genesis. Capability timechecks are
    /// deferred to the caller's final check.
    fn replay(&self, stream_type: StreamType, commits: &[Commit]) -> Result<StreamState> {
        let handler = self.handler_for(stream_type)?;
        let mut state: Option<StreamState> = None;
        for commit in commits {
            let data = CommitData {
                commit,
                disable_timecheck: true,
            };
            state = Some(handler.apply_commit(&data, state.as_ref())?);
        }
        state.ok_or_else(|| RepositoryError::InvalidCommit("empty commit log".into()))
    }

    // --- Sync ---

    /// Bring a running state up to the network tip, bounded by `timeout`.
    ///
    /// On timeout the attempt continues in the background and its eventual
    /// result is still emitted; this call returns with whatever progress was
    /// made. Network failures are logged, never raised. `hint_tip` feeds a
    /// locally known tip into conflict resolution so tips unknown to the
    /// network are not lost.
    pub fn sync(&self, state: &Arc<RunningState>, timeout: Duration, hint_tip: Option<Cid>) {
        let id = state.id();

        // At most one in-flight sync per stream: observe a previous
        // abandoned attempt instead of stacking another.
        let existing = self.inner.active_syncs.lock().get(&id).cloned();
        if let Some(done) = existing {
            let _ = done.recv_timeout(timeout);
            return;
        }

        let (done_tx, done_rx) = bounded(1);
        self.inner.active_syncs.lock().insert(id, done_rx.clone());

        let manager = self.clone();
        let state = Arc::clone(state);
        std::thread::spawn(move || {
            manager.sync_worker(&state, hint_tip);
            manager.inner.active_syncs.lock().remove(&state.id());
            let _ = done_tx.send(());
        });

        if done_rx.recv_timeout(timeout).is_err() {
            tracing::debug!(stream = %id, "sync timed out; attempt continues in background");
        }
    }

    fn sync_worker(&self, state: &Arc<RunningState>, hint_tip: Option<Cid>) {
        let id = state.id();
        if let Some(tip) = self.inner.dispatcher.fetch_tip(&id) {
            self.apply_tip(state, tip);
        }
        if let Some(hint) = hint_tip {
            self.apply_tip(state, hint);
        }
    }

    /// Apply a remote or hinted tip. All failures here are recoverable: the
    /// state stays at last-known-good and the problem is logged.
    fn apply_tip(&self, state: &Arc<RunningState>, tip: Cid) {
        let current = state.current();
        if current.log.iter().any(|e| e.cid == tip) {
            return;
        }
        let Some(stream_id) = current.stream_id() else {
            return;
        };
        let Some(head) = self.inner.dispatcher.fetch_commit(&tip) else {
            tracing::debug!(stream = %stream_id, tip = %tip, "tip commit not fetchable; keeping current state");
            return;
        };

        let candidate = if head.prev == current.tip() {
            let applied = self.handler_for(current.stream_type).and_then(|handler| {
                handler.apply_commit(
                    &CommitData {
                        commit: &head,
                        disable_timecheck: true,
                    },
                    Some(&current),
                )
            });
            match applied {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(stream = %stream_id, error = %e, "remote tip rejected by handler");
                    return;
                }
            }
        } else {
            match self.rebuild_candidate(stream_id, &current, head, tip) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::warn!(stream = %stream_id, error = %e, "could not rebuild remote log");
                    return;
                }
            }
        };

        if let Err(e) = self.resolve_and_emit(state, current, candidate) {
            tracing::warn!(stream = %stream_id, error = %e, "failed to persist synced state");
        }
    }

    // --- Historical snapshots ---

    /// Replay from genesis to the requested commit, producing an immutable
    /// snapshot. The commit may sit off the canonical log as long as its
    /// branch survives conflict resolution.
    pub fn at_commit(&self, base: &Arc<RunningState>, commit_id: CommitId) -> Result<StreamState> {
        let current = base.current();
        let stream_id = commit_id.stream;

        if let Some(pos) = current.log.iter().position(|e| e.cid == commit_id.commit) {
            let commits = self.fetch_log(stream_id, &current.log[..=pos])?;
            return self.replay(current.stream_type, &commits);
        }

        let head = self
            .inner
            .dispatcher
            .fetch_commit(&commit_id.commit)
            .ok_or(RepositoryError::CommitNotInLog {
                stream: stream_id,
                commit: commit_id.commit,
            })?;
        let candidate = self.rebuild_candidate(stream_id, &current, head, commit_id.commit)?;

        if log_extends(&current.log, &candidate.log) {
            return Ok(candidate);
        }
        match self.inner.conflict_resolution.resolve(&current, &candidate) {
            Winner::Candidate => Ok(candidate),
            Winner::Current => Err(RepositoryError::CommitNotInLog {
                stream: stream_id,
                commit: commit_id.commit,
            }),
        }
    }

    /// Snapshot at the latest anchor with `timestamp <= at`.
    pub fn at_time(&self, base: &Arc<RunningState>, at: Timestamp) -> Result<StreamState> {
        let current = base.current();
        let anchor = current.log.iter().rev().find(|e| {
            matches!(e.commit_type, CommitType::Anchor)
                && e.timestamp.map_or(false, |t| t <= at)
        });
        match anchor {
            Some(entry) => self.at_commit(base, CommitId::new(base.id(), entry.cid)),
            None => Err(RepositoryError::NoAnchorBefore(at)),
        }
    }

    // --- Anchoring ---

    /// Persist an anchor request for the stream's tip and start consuming
    /// the anchor service's events.
    pub fn request_anchor(&self, state: &Arc<RunningState>) -> Result<()> {
        let id = state.id();
        let tip = state
            .tip()
            .ok_or_else(|| RepositoryError::InvalidCommit("anchor request for empty log".into()))?;
        let record = AnchorRequestRecord {
            stream_id: id,
            commit: tip,
            created_at: Timestamp::now(),
        };
        self.inner.anchor_requests.save(&id, &record)?;

        self.update_anchor_status(state, AnchorStatus::Pending);
        let events = self.inner.anchor_service.request_anchor(&state.current());
        self.process_anchor_events(Arc::clone(state), events);
        Ok(())
    }

    /// Re-attach a previously persisted anchor request to a freshly loaded
    /// running state.
    pub fn confirm_anchor_response(&self, state: &Arc<RunningState>, commit: Cid) {
        let events = self.inner.anchor_service.confirm(&state.current(), &commit);
        self.process_anchor_events(Arc::clone(state), events);
    }

    fn process_anchor_events(&self, state: Arc<RunningState>, events: Receiver<AnchorEvent>) {
        let manager = self.clone();
        std::thread::spawn(move || {
            for event in events.iter() {
                match event {
                    AnchorEvent::Pending => {
                        manager.update_anchor_status(&state, AnchorStatus::Pending)
                    }
                    AnchorEvent::Processing => {
                        manager.update_anchor_status(&state, AnchorStatus::Processing)
                    }
                    AnchorEvent::Completed { commit } => {
                        manager.finish_anchor(&state, commit);
                        break;
                    }
                    AnchorEvent::Failed { reason } => {
                        tracing::warn!(stream = %state.id(), reason = %reason, "anchor request failed");
                        manager.update_anchor_status(&state, AnchorStatus::Failed);
                        if let Err(e) = manager.inner.anchor_requests.delete(&state.id()) {
                            tracing::warn!(stream = %state.id(), error = %e, "could not delete failed anchor request");
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Apply the produced anchor commit through the execution queue like any
    /// other mutation, then retire the stored request.
    fn finish_anchor(&self, state: &Arc<RunningState>, commit: Commit) {
        let id = state.id();
        let manager = self.clone();
        let handle = self.inner.execution_q.run(id, move || {
            manager.apply_commit(id, commit)?;
            manager.inner.anchor_requests.delete(&id)?;
            Ok(())
        });
        if let Err(e) = handle.wait() {
            tracing::warn!(stream = %id, error = %e, "failed to apply anchor commit");
        }
    }

    fn update_anchor_status(&self, state: &Arc<RunningState>, status: AnchorStatus) {
        let mut next = state.current();
        if next.anchor_status == status {
            return;
        }
        next.anchor_status = status;
        if state.next(next) {
            if let Err(e) = self.save_if_pinned(state) {
                tracing::warn!(stream = %state.id(), error = %e, "could not persist anchor status");
            }
        }
    }

    // --- Bookkeeping ---

    pub fn mark_pinned_and_synced(&self, id: StreamId) {
        self.inner.synced_pinned.lock().insert(id);
    }

    pub fn mark_unpinned(&self, id: StreamId) {
        self.inner.synced_pinned.lock().remove(&id);
    }

    /// Whether a pinned stream was already synced in this process lifetime.
    pub fn was_pinned_stream_synced(&self, id: StreamId) -> bool {
        self.inner.synced_pinned.lock().contains(&id)
    }

    /// Ask the dispatcher to publish the stream's current tip.
    pub fn publish_tip(&self, state: &Arc<RunningState>) {
        if let Some(tip) = state.tip() {
            self.inner.dispatcher.publish_tip(&state.id(), &tip);
        }
    }

    fn save_if_pinned(&self, state: &Arc<RunningState>) -> Result<()> {
        if state.is_pinned() {
            self.inner.pin_store.state_store().save(&state.current())?;
        }
        Ok(())
    }
}

/// Whether `candidate` keeps `base` as a prefix.
pub(crate) fn log_extends(base: &[LogEntry], candidate: &[LogEntry]) -> bool {
    candidate.len() >= base.len() && base.iter().zip(candidate).all(|(a, b)| a.cid == b.cid)
}

/// Verify every capability-scoped commit in the log: each is valid when its
/// expiry lies in the future, or when a later anchor proves the commit
/// landed before the capability expired.
pub fn check_capability_expiry(state: &StreamState, now: Timestamp) -> Result<()> {
    for (i, entry) in state.log.iter().enumerate() {
        let Some(expiry) = entry.capability_expiry else {
            continue;
        };
        let covered = state.log[i..].iter().any(|later| {
            matches!(later.commit_type, CommitType::Anchor)
                && later.timestamp.map_or(false, |t| t <= expiry)
        });
        if covered {
            continue;
        }
        if expiry <= now {
            return Err(RepositoryError::CapabilityExpired(expiry));
        }
    }
    Ok(())
}
