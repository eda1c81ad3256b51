//! Shared fixtures: an in-memory network, a JSON document handler, and a
//! scriptable anchor service.

// Each test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stream_repo::{
    AnchorEvent, AnchorService, AnchorStatus, Cid, Commit, CommitData, CommitType, Dispatcher,
    Handler, IndexingApi, KvStore, LogEntry, LogLengthResolution, MemoryKv, Repository,
    RepositoryConfig, RepositoryError, Result, StreamId, StreamMetadata, StreamState, StreamType,
    Timestamp,
};

pub const DOC_TYPE: StreamType = StreamType(0);

// --- Network ---

/// In-memory commit/tip network standing in for the dispatcher.
#[derive(Default)]
pub struct FakeNetwork {
    commits: Mutex<HashMap<Cid, Commit>>,
    tips: Mutex<HashMap<StreamId, Cid>>,
    published: Mutex<Vec<(StreamId, Cid)>>,
}

impl FakeNetwork {
    pub fn add_commit(&self, commit: &Commit) {
        self.commits.lock().insert(commit.cid, commit.clone());
    }

    pub fn set_tip(&self, stream_id: StreamId, tip: Cid) {
        self.tips.lock().insert(stream_id, tip);
    }

    pub fn published(&self) -> Vec<(StreamId, Cid)> {
        self.published.lock().clone()
    }

    pub fn publish_count(&self, stream_id: StreamId) -> usize {
        self.published
            .lock()
            .iter()
            .filter(|(id, _)| *id == stream_id)
            .count()
    }
}

impl Dispatcher for FakeNetwork {
    fn fetch_commit(&self, cid: &Cid) -> Option<Commit> {
        self.commits.lock().get(cid).cloned()
    }

    fn fetch_tip(&self, stream_id: &StreamId) -> Option<Cid> {
        self.tips.lock().get(stream_id).copied()
    }

    fn publish_tip(&self, stream_id: &StreamId, tip: &Cid) {
        self.published.lock().push((*stream_id, *tip));
    }
}

// --- Handler ---

/// JSON document streams: genesis sets content/controllers/model, signed
/// commits replace content, anchor commits mark the stream anchored.
pub struct DocumentHandler;

impl Handler for DocumentHandler {
    fn stream_type(&self) -> StreamType {
        DOC_TYPE
    }

    fn apply_commit(
        &self,
        data: &CommitData<'_>,
        prev: Option<&StreamState>,
    ) -> Result<StreamState> {
        let commit = data.commit;
        match commit.commit_type {
            CommitType::Genesis => {
                if prev.is_some() {
                    return Err(RepositoryError::InvalidCommit(
                        "genesis on existing state".into(),
                    ));
                }
                let payload: Value = serde_json::from_slice(&commit.payload)?;
                let metadata = StreamMetadata {
                    controllers: payload
                        .get("controllers")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default(),
                    model: payload
                        .get("model")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                };
                Ok(StreamState {
                    stream_type: DOC_TYPE,
                    log: vec![LogEntry::from(commit)],
                    content: payload.get("content").cloned().unwrap_or(Value::Null),
                    metadata,
                    anchor_status: AnchorStatus::NotRequested,
                })
            }
            CommitType::Signed => {
                let prev = prev.ok_or_else(|| {
                    RepositoryError::InvalidCommit("update without previous state".into())
                })?;
                if !data.disable_timecheck {
                    if let Some(expiry) = commit.capability_expiry {
                        if expiry <= Timestamp::now() {
                            return Err(RepositoryError::CapabilityExpired(expiry));
                        }
                    }
                }
                let payload: Value = serde_json::from_slice(&commit.payload)?;
                let mut next = prev.clone();
                next.log.push(LogEntry::from(commit));
                if let Some(content) = payload.get("content") {
                    next.content = content.clone();
                }
                Ok(next)
            }
            CommitType::Anchor => {
                let prev = prev.ok_or_else(|| {
                    RepositoryError::InvalidCommit("anchor without previous state".into())
                })?;
                let mut next = prev.clone();
                next.log.push(LogEntry::from(commit));
                next.anchor_status = AnchorStatus::Anchored;
                Ok(next)
            }
        }
    }
}

pub fn genesis_payload(content: &Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "content": content,
        "controllers": ["did:key:tester"],
    }))
    .unwrap()
}

pub fn genesis_payload_with_model(content: &Value, model: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "content": content,
        "controllers": ["did:key:tester"],
        "model": model,
    }))
    .unwrap()
}

pub fn update_payload(content: &Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "content": content })).unwrap()
}

/// Publish a genesis commit to the network and derive its stream ID.
pub fn create_genesis(network: &FakeNetwork, content: &Value) -> (StreamId, Commit) {
    let commit = Commit::genesis(genesis_payload(content));
    network.add_commit(&commit);
    (StreamId::new(DOC_TYPE, commit.cid), commit)
}

/// Publish a signed update to the network.
pub fn create_update(network: &FakeNetwork, prev: Cid, content: &Value) -> Commit {
    let commit = Commit::signed(prev, update_payload(content));
    network.add_commit(&commit);
    commit
}

// --- Anchor service ---

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AnchorMode {
    /// Record requests and emit `Pending`; the channel stays open.
    Manual,
    /// Immediately produce an anchor commit and complete.
    Instant,
}

pub struct FakeAnchorService {
    mode: AnchorMode,
    network: Arc<FakeNetwork>,
    requests: Mutex<Vec<(StreamId, Cid)>>,
    confirms: Mutex<Vec<(StreamId, Cid)>>,
    // Keeps manual-mode channels open so subscribers stay attached.
    open_senders: Mutex<Vec<Sender<AnchorEvent>>>,
}

impl FakeAnchorService {
    pub fn new(mode: AnchorMode, network: Arc<FakeNetwork>) -> Self {
        Self {
            mode,
            network,
            requests: Mutex::new(Vec::new()),
            confirms: Mutex::new(Vec::new()),
            open_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(StreamId, Cid)> {
        self.requests.lock().clone()
    }

    pub fn confirms(&self) -> Vec<(StreamId, Cid)> {
        self.confirms.lock().clone()
    }

    fn events_for(&self, tip: Cid) -> Receiver<AnchorEvent> {
        let (tx, rx) = unbounded();
        let _ = tx.send(AnchorEvent::Pending);
        match self.mode {
            AnchorMode::Manual => self.open_senders.lock().push(tx),
            AnchorMode::Instant => {
                let anchor = Commit::anchor(tip, Timestamp::now());
                self.network.add_commit(&anchor);
                let _ = tx.send(AnchorEvent::Completed { commit: anchor });
            }
        }
        rx
    }
}

impl AnchorService for FakeAnchorService {
    fn request_anchor(&self, state: &StreamState) -> Receiver<AnchorEvent> {
        let tip = state.tip().expect("anchor request for empty log");
        self.requests
            .lock()
            .push((state.stream_id().unwrap(), tip));
        self.events_for(tip)
    }

    fn confirm(&self, state: &StreamState, commit: &Cid) -> Receiver<AnchorEvent> {
        self.confirms
            .lock()
            .push((state.stream_id().unwrap(), *commit));
        self.events_for(*commit)
    }

    fn supported_chains(&self) -> Vec<String> {
        vec!["inmemory:test".to_string()]
    }
}

// --- Indexing ---

pub struct FakeIndexing {
    models: HashSet<String>,
    indexed: Mutex<Vec<StreamId>>,
}

impl FakeIndexing {
    pub fn new(models: &[&str]) -> Self {
        Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            indexed: Mutex::new(Vec::new()),
        }
    }

    pub fn indexed(&self) -> Vec<StreamId> {
        self.indexed.lock().clone()
    }
}

impl IndexingApi for FakeIndexing {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn should_index_stream(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    fn index_stream(&self, state: &StreamState) -> Result<()> {
        self.indexed.lock().push(state.stream_id().unwrap());
        Ok(())
    }
}

// --- Assembly ---

pub struct TestContext {
    pub repo: Repository,
    pub network: Arc<FakeNetwork>,
    pub anchors: Arc<FakeAnchorService>,
    pub indexing: Arc<FakeIndexing>,
    pub kv: Arc<MemoryKv>,
}

pub fn build_repo(config: RepositoryConfig, models: &[&str], mode: AnchorMode) -> TestContext {
    let network = Arc::new(FakeNetwork::default());
    let kv = Arc::new(MemoryKv::new());
    build_repo_with(config, models, mode, network, kv)
}

/// Build a repository over existing collaborator backends, e.g. to simulate
/// a process restart against the same stores.
pub fn build_repo_with(
    config: RepositoryConfig,
    models: &[&str],
    mode: AnchorMode,
    network: Arc<FakeNetwork>,
    kv: Arc<MemoryKv>,
) -> TestContext {
    let anchors = Arc::new(FakeAnchorService::new(mode, Arc::clone(&network)));
    let indexing = Arc::new(FakeIndexing::new(models));

    let repo = Repository::new(config);
    repo.set_deps(
        Arc::clone(&network) as Arc<dyn Dispatcher>,
        vec![Arc::new(DocumentHandler)],
        Arc::new(LogLengthResolution),
        Arc::clone(&anchors) as Arc<dyn AnchorService>,
        Arc::clone(&kv) as Arc<dyn KvStore>,
        Arc::clone(&indexing) as Arc<dyn IndexingApi>,
    )
    .unwrap();

    TestContext {
        repo,
        network,
        anchors,
        indexing,
        kv,
    }
}

/// Quiet write options: no anchoring, no publishing.
pub fn quiet_writes() -> stream_repo::WriteOpts {
    stream_repo::WriteOpts {
        anchor: false,
        publish: false,
        pin: None,
    }
}

/// Poll `predicate` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
