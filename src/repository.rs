//! The repository: tiered loading, lifecycle, and pin/index policy.
//!
//! All loads go through the loading queue and all mutations through the
//! execution queue, keyed by stream, so each stream evolves through a
//! single well-defined history. Queued tasks consult the in-memory cache,
//! then the local state store, then the network.

use crate::api::{AnchorService, ConflictResolution, Dispatcher, Handler, IndexingApi};
use crate::error::{RepositoryError, Result};
use crate::queue::ExecutionQueue;
use crate::state::{
    check_capability_expiry, LoadFn, RunningState, StateCache, StateManager, StateSubscription,
};
use crate::stores::{AnchorRequestStore, KvStore, PinStore};
use crate::types::{
    Commit, CommitId, LoadOpts, OpType, StreamId, StreamState, SyncMode, Timestamp, WriteOpts,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Repository configuration.
#[derive(Clone, Debug)]
pub struct RepositoryConfig {
    /// Maximum number of evictable entries in the live-state cache.
    pub cache_limit: usize,

    /// Concurrently executing tasks per queue.
    pub concurrency_limit: usize,

    /// Default bound on network sync during loads.
    pub sync_timeout: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cache_limit: 500,
            concurrency_limit: 16,
            sync_timeout: Duration::from_secs(3),
        }
    }
}

/// Atomic operation counters.
#[derive(Default)]
pub struct RepositoryStats {
    cache_hit_memory: AtomicU64,
    cache_hit_local: AtomicU64,
    cache_hit_remote: AtomicU64,
    evictions: AtomicU64,
}

impl RepositoryStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hit_memory: self.cache_hit_memory.load(Ordering::SeqCst),
            cache_hit_local: self.cache_hit_local.load(Ordering::SeqCst),
            cache_hit_remote: self.cache_hit_remote.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time view of the repository counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Loads served from the in-memory cache.
    pub cache_hit_memory: u64,
    /// Loads served from the local state store.
    pub cache_hit_local: u64,
    /// Loads that fetched the genesis commit from the network.
    pub cache_hit_remote: u64,
    /// Running states evicted from the cache.
    pub evictions: u64,
}

/// Collaborators installed by `set_deps`. Construction is two-phase because
/// the state manager needs a load callback back into the repository.
struct Deps {
    dispatcher: Arc<dyn Dispatcher>,
    pin_store: Arc<PinStore>,
    anchor_requests: Arc<AnchorRequestStore>,
    indexing: Arc<dyn IndexingApi>,
    state_manager: StateManager,
}

struct RepoInner {
    config: RepositoryConfig,
    stats: Arc<RepositoryStats>,
    cache: StateCache,
    loading_q: ExecutionQueue,
    execution_q: Arc<ExecutionQueue>,
    deps: OnceLock<Deps>,
    closed: AtomicBool,
}

/// The state-management core of the stream database.
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    /// Build the repository shell. Collaborators are installed afterwards
    /// with [`Repository::set_deps`].
    pub fn new(config: RepositoryConfig) -> Self {
        let stats = Arc::new(RepositoryStats::default());
        let evict_stats = Arc::clone(&stats);
        let cache = StateCache::new(
            config.cache_limit,
            Box::new(move |id, state: Arc<RunningState>| {
                if state.subscriber_count() > 0 {
                    // Subscribed states are endured by `updates`; reaching
                    // this point means a caller bypassed it.
                    tracing::warn!(stream = %id, "evicting a state that still has subscribers");
                }
                state.complete();
                evict_stats.evictions.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let loading_q = ExecutionQueue::new("loading queue", config.concurrency_limit);
        let execution_q = Arc::new(ExecutionQueue::new(
            "execution queue",
            config.concurrency_limit,
        ));

        Self {
            inner: Arc::new(RepoInner {
                config,
                stats,
                cache,
                loading_q,
                execution_q,
                deps: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Install the collaborators and construct the state manager with its
    /// load callback bound back into this repository. Call exactly once.
    pub fn set_deps(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        handlers: Vec<Arc<dyn Handler>>,
        conflict_resolution: Arc<dyn ConflictResolution>,
        anchor_service: Arc<dyn AnchorService>,
        kv: Arc<dyn KvStore>,
        indexing: Arc<dyn IndexingApi>,
    ) -> Result<()> {
        let pin_store = Arc::new(PinStore::open(Arc::clone(&kv)));
        let anchor_requests = Arc::new(AnchorRequestStore::open(kv));
        indexing.init()?;

        let weak = Arc::downgrade(&self.inner);
        let load_fn: LoadFn = Box::new(move |stream_id| {
            let inner = weak
                .upgrade()
                .ok_or(RepositoryError::QueueClosed("repository"))?;
            let (state, _) = inner.load_genesis(stream_id)?;
            Ok(state)
        });

        let state_manager = StateManager::new(
            Arc::clone(&dispatcher),
            handlers,
            conflict_resolution,
            anchor_service,
            Arc::clone(&pin_store),
            Arc::clone(&anchor_requests),
            Arc::clone(&self.inner.execution_q),
            load_fn,
        );

        self.inner
            .deps
            .set(Deps {
                dispatcher,
                pin_store,
                anchor_requests,
                indexing,
                state_manager,
            })
            .map_err(|_| RepositoryError::AlreadyInitialized)
    }

    // --- Loading ---

    /// Load a stream's running state, syncing per `opts.sync`.
    pub fn load(&self, stream_id: StreamId, opts: &LoadOpts) -> Result<Arc<RunningState>> {
        self.inner.ensure_open()?;
        let inner = Arc::clone(&self.inner);
        let opts = opts.clone();
        self.inner
            .loading_q
            .run(stream_id, move || inner.load_task(stream_id, &opts))
            .wait()
    }

    /// Immutable snapshot of a stream at a specific commit.
    ///
    /// The base load defers capability checks; anchors within the replayed
    /// log can prove capabilities were valid when used, so the check runs on
    /// the final snapshot instead.
    pub fn load_at_commit(&self, commit_id: CommitId, opts: &LoadOpts) -> Result<StreamState> {
        let mut base_opts = opts.clone();
        base_opts.skip_capability_checks = true;
        let base = self.load(commit_id.stream, &base_opts)?;

        let snapshot = self.inner.deps()?.state_manager.at_commit(&base, commit_id)?;
        if !opts.skip_capability_checks {
            check_capability_expiry(&snapshot, Timestamp::now())?;
        }
        Ok(snapshot)
    }

    /// Immutable snapshot of a stream at the latest anchor no later than
    /// `at`.
    pub fn load_at_time(
        &self,
        stream_id: StreamId,
        at: Timestamp,
        opts: &LoadOpts,
    ) -> Result<StreamState> {
        let base = self.load(stream_id, opts)?;
        self.inner.deps()?.state_manager.at_time(&base, at)
    }

    // --- Mutation ---

    /// Apply a commit to a stream, then the write options.
    pub fn apply_commit(
        &self,
        stream_id: StreamId,
        commit: Commit,
        opts: &WriteOpts,
    ) -> Result<Arc<RunningState>> {
        self.inner.ensure_open()?;
        let manager = self.inner.deps()?.state_manager.clone();
        let state = self
            .inner
            .execution_q
            .run(stream_id, move || manager.apply_commit(stream_id, commit))
            .wait()?;
        self.inner.apply_write_opts(&state, opts, OpType::Update)?;
        Ok(state)
    }

    /// Load-or-create semantics for a freshly published genesis commit.
    ///
    /// A create whose genesis is content-identical to an existing stream
    /// resolves to that stream and is classified as a load; the pin policy
    /// then warns about and ignores any explicit pin flag, the same as for
    /// any non-create operation.
    pub fn apply_create_opts(
        &self,
        stream_id: StreamId,
        load_opts: &LoadOpts,
        write_opts: &WriteOpts,
    ) -> Result<Arc<RunningState>> {
        let state = self.load(stream_id, load_opts)?;
        let op = if state.current().log.len() == 1 {
            OpType::Create
        } else {
            OpType::Load
        };
        self.inner.apply_write_opts(&state, write_opts, op)?;
        Ok(state)
    }

    // --- Pinning ---

    /// Pin a stream: persist its current state and mark it durable.
    pub fn pin(&self, state: &Arc<RunningState>, force: bool) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.pin_state(state, force)
    }

    /// Unpin a stream. Refused for indexed streams, which require durable
    /// state. Optionally publishes the tip first.
    pub fn unpin(&self, state: &Arc<RunningState>, publish: bool) -> Result<()> {
        self.inner.ensure_open()?;
        let deps = self.inner.deps()?;

        let current = state.current();
        if let Some(model) = current.metadata.model.as_ref() {
            if deps.indexing.should_index_stream(model) {
                return Err(RepositoryError::CannotUnpinIndexed(model.clone()));
            }
        }

        if publish {
            deps.state_manager.publish_tip(state);
        }
        deps.pin_store.rm(&state.id())?;
        state.set_pinned(false);
        deps.state_manager.mark_unpinned(state.id());
        Ok(())
    }

    /// List pinned stream IDs; with `stream_id` given, at most that one.
    pub fn list_pinned(&self, stream_id: Option<StreamId>) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        self.inner.deps()?.pin_store.ls(stream_id.as_ref())
    }

    /// One arbitrary pinned stream's stored state, if any. The pin store is
    /// asked for at most one ID; receiving more is a contract violation.
    pub fn random_pinned_stream(&self) -> Result<Option<StreamState>> {
        self.inner.ensure_open()?;
        let deps = self.inner.deps()?;
        let ids = deps.pin_store.state_store().list_stored_stream_ids(None, 1)?;
        if ids.len() > 1 {
            return Err(RepositoryError::PinStoreContractViolation(format!(
                "requested one id, got {}",
                ids.len()
            )));
        }
        match ids.first() {
            None => Ok(None),
            Some(raw) => {
                let id = StreamId::from_store_key(raw)?;
                deps.pin_store.state_store().load(&id)
            }
        }
    }

    // --- Observation ---

    /// Subscribe to a stream's state updates, seeded by `init`.
    ///
    /// The underlying running state is endured in the cache for the lifetime
    /// of the subscription, so memory pressure never severs a live observer.
    pub fn updates(&self, init: &StreamState) -> Result<Updates> {
        self.inner.ensure_open()?;
        let genesis = init.log.first().ok_or_else(|| {
            RepositoryError::InvalidCommit("subscription seed with empty log".into())
        })?;
        let stream_id = StreamId::new(init.stream_type, genesis.cid);

        let running = match self.inner.running_from_memory_or_store(stream_id)? {
            Some(running) => running,
            None => {
                let seed = init.clone();
                let (running, _) = self
                    .inner
                    .cache
                    .get_or_insert(stream_id, || {
                        Arc::new(RunningState::new(stream_id, seed, false))
                    });
                running
            }
        };

        self.inner.cache.endure(stream_id, Arc::clone(&running));
        let subscription = running.subscribe();
        Ok(Updates {
            subscription,
            _endure: EndureGuard {
                inner: Arc::clone(&self.inner),
                stream_id,
            },
        })
    }

    /// Non-blocking snapshot from memory or the local store; never touches
    /// the network or creates a running state.
    pub fn stream_state(&self, stream_id: StreamId) -> Result<Option<StreamState>> {
        self.inner.ensure_open()?;
        self.inner.from_memory_or_store(stream_id)
    }

    /// Current operation counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    // --- Lifecycle ---

    /// Drain both queues, complete and drop every cached state, and close
    /// the stores. Idempotent; all later operations fail with `QueueClosed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.loading_q.close();
        self.inner.execution_q.close();
        for (_, state) in self.inner.cache.drain() {
            state.complete();
        }
        if let Some(deps) = self.inner.deps.get() {
            deps.pin_store.close()?;
            deps.indexing.close()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl RepoInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RepositoryError::QueueClosed("repository"));
        }
        Ok(())
    }

    fn deps(&self) -> Result<&Deps> {
        self.deps.get().ok_or(RepositoryError::NotInitialized)
    }

    /// The body of `load`; runs while holding the loading-queue slot for
    /// this stream.
    fn load_task(self: &Arc<Self>, stream_id: StreamId, opts: &LoadOpts) -> Result<Arc<RunningState>> {
        let deps = self.deps()?;
        let timeout = opts.sync_timeout.unwrap_or(self.config.sync_timeout);

        let (state, synced) = match opts.sync {
            SyncMode::PreferCache | SyncMode::SyncOnError => {
                let (state, already_synced) = self.load_genesis(stream_id)?;
                if !already_synced {
                    deps.state_manager.sync(&state, timeout, None);
                }
                (state, true)
            }
            SyncMode::NeverSync => {
                let (state, _) = self.load_genesis(stream_id)?;
                (state, false)
            }
            SyncMode::SyncAlways => {
                // Capture local knowledge first so a tip unknown to the
                // network still reaches conflict resolution.
                let hint = self.from_memory_or_store(stream_id)?.and_then(|s| s.tip());
                let (state, _) = self.load_genesis(stream_id)?;
                deps.state_manager.sync(&state, timeout, hint);
                (state, true)
            }
        };

        if !opts.skip_capability_checks {
            check_capability_expiry(&state.current(), Timestamp::now())?;
        }
        if synced && state.is_pinned() {
            deps.state_manager.mark_pinned_and_synced(stream_id);
        }
        Ok(state)
    }

    /// Tiered materialisation: memory, then local state store, then network
    /// genesis. Returns the running state plus whether it is already synced.
    /// Only callable while holding either queue's slot for this stream.
    fn load_genesis(self: &Arc<Self>, stream_id: StreamId) -> Result<(Arc<RunningState>, bool)> {
        let deps = self.deps()?;

        if let Some(state) = self.cache.get(&stream_id) {
            self.stats.cache_hit_memory.fetch_add(1, Ordering::SeqCst);
            return Ok((state, true));
        }

        if let Some(stored) = deps.pin_store.state_store().load(&stream_id)? {
            self.stats.cache_hit_local.fetch_add(1, Ordering::SeqCst);
            let (running, inserted) = self.cache.get_or_insert(stream_id, || {
                Arc::new(RunningState::new(stream_id, stored, true))
            });
            if inserted {
                // Rehydrate an anchor request that survived a restart.
                if let Some(record) = deps.anchor_requests.load(&stream_id)? {
                    deps.state_manager
                        .confirm_anchor_response(&running, record.commit);
                }
            }
            let synced = deps.state_manager.was_pinned_stream_synced(stream_id);
            return Ok((running, synced));
        }

        let genesis = deps
            .dispatcher
            .fetch_commit(&stream_id.genesis)
            .ok_or(RepositoryError::StreamNotFound(stream_id))?;
        let state = deps
            .state_manager
            .state_from_genesis(stream_id.stream_type, &genesis)?;
        self.stats.cache_hit_remote.fetch_add(1, Ordering::SeqCst);

        match deps.anchor_requests.load(&stream_id) {
            Ok(Some(_)) => {
                // Anchor requests must correspond to pinned states; a stale
                // record is ignored, never fatal.
                tracing::warn!(stream = %stream_id, "anchor request for a stream absent from the pin store; ignoring");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(stream = %stream_id, error = %e, "could not read anchor request store");
            }
        }

        let (running, _) = self.cache.get_or_insert(stream_id, || {
            Arc::new(RunningState::new(stream_id, state, false))
        });
        Ok((running, false))
    }

    /// Snapshot from memory or the local store, creating nothing.
    fn from_memory_or_store(&self, stream_id: StreamId) -> Result<Option<StreamState>> {
        if let Some(state) = self.cache.get(&stream_id) {
            return Ok(Some(state.current()));
        }
        self.deps()?.pin_store.state_store().load(&stream_id)
    }

    /// Running state from memory or the local store, creating one from the
    /// store when needed.
    fn running_from_memory_or_store(
        self: &Arc<Self>,
        stream_id: StreamId,
    ) -> Result<Option<Arc<RunningState>>> {
        if let Some(state) = self.cache.get(&stream_id) {
            return Ok(Some(state));
        }
        let deps = self.deps()?;
        if let Some(stored) = deps.pin_store.state_store().load(&stream_id)? {
            let (running, _) = self.cache.get_or_insert(stream_id, || {
                Arc::new(RunningState::new(stream_id, stored, true))
            });
            return Ok(Some(running));
        }
        Ok(None)
    }

    /// Anchor/publish per the write options, then the pin policy.
    fn apply_write_opts(
        &self,
        state: &Arc<RunningState>,
        opts: &WriteOpts,
        op: OpType,
    ) -> Result<()> {
        let deps = self.deps()?;
        if opts.anchor {
            deps.state_manager.request_anchor(state)?;
        }
        if opts.publish {
            deps.state_manager.publish_tip(state);
        }
        self.handle_pin_opts(state, opts, op)
    }

    /// Pin policy: pinning is decided at creation; afterwards only the
    /// indexing requirement can (re-)pin a stream, and explicit pin flags
    /// are warned about and ignored.
    fn handle_pin_opts(
        &self,
        state: &Arc<RunningState>,
        opts: &WriteOpts,
        op: OpType,
    ) -> Result<()> {
        let deps = self.deps()?;
        let current = state.current();
        let indexed = current
            .metadata
            .model
            .as_deref()
            .map(|m| deps.indexing.should_index_stream(m))
            .unwrap_or(false);

        match op {
            OpType::Create => {
                if indexed || opts.pin != Some(false) {
                    self.pin_state(state, false)?;
                }
            }
            OpType::Update | OpType::Load => {
                if opts.pin.is_some() {
                    tracing::warn!(
                        stream = %state.id(),
                        "pin flag ignored: pin state can only change at stream creation"
                    );
                }
                if indexed {
                    self.pin_state(state, false)?;
                }
            }
        }

        if indexed {
            deps.indexing.index_stream(&current)?;
        }
        Ok(())
    }

    fn pin_state(&self, state: &Arc<RunningState>, force: bool) -> Result<()> {
        self.deps()?.pin_store.add(&state.current(), force)?;
        state.set_pinned(true);
        Ok(())
    }
}

/// Live subscription to one stream's state, handed out by
/// [`Repository::updates`]. While this handle is alive the underlying
/// running state cannot be evicted.
pub struct Updates {
    subscription: StateSubscription,
    // Dropped after the subscription, releasing the endurance reference
    // only once the observer count has already decremented.
    _endure: EndureGuard,
}

impl Updates {
    /// Receive the next state (blocking).
    pub fn recv(&self) -> std::result::Result<StreamState, crossbeam_channel::RecvError> {
        self.subscription.recv()
    }

    /// Receive without blocking.
    pub fn try_recv(&self) -> std::result::Result<StreamState, crossbeam_channel::TryRecvError> {
        self.subscription.try_recv()
    }

    /// Receive with a timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<StreamState, crossbeam_channel::RecvTimeoutError> {
        self.subscription.recv_timeout(timeout)
    }
}

struct EndureGuard {
    inner: Arc<RepoInner>,
    stream_id: StreamId,
}

impl Drop for EndureGuard {
    fn drop(&mut self) {
        self.inner.cache.free(self.stream_id);
    }
}
