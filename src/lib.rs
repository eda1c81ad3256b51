//! # Stream Repository
//!
//! The state-management core of a content-addressed, append-only stream
//! database. Streams are per-identity logs whose tip is a commit hash and
//! whose state is deterministically derived by replaying commits through a
//! type-specific handler.
//!
//! ## Core Concepts
//!
//! - **Streams**: Append-only commit logs identified by their genesis hash
//!   plus a type tag
//! - **Running states**: Observable, live projections of a stream's log
//! - **Pinning**: Durable local persistence that survives restarts
//! - **Anchoring**: External timestamp proofs driven through the anchor
//!   service
//! - **Serialisation**: Per-stream FIFO queues so each stream evolves
//!   through a single history
//!
//! ## Example
//!
//! ```ignore
//! use stream_repo::{LoadOpts, Repository, RepositoryConfig, WriteOpts};
//!
//! let repo = Repository::new(RepositoryConfig::default());
//! repo.set_deps(dispatcher, handlers, conflict, anchors, kv, indexing)?;
//!
//! // Create (or resolve) a stream from a published genesis commit
//! let state = repo.apply_create_opts(stream_id, &LoadOpts::default(), &WriteOpts::default())?;
//!
//! // Apply an update
//! repo.apply_commit(stream_id, commit, &WriteOpts::default())?;
//!
//! // Observe live updates
//! let updates = repo.updates(&state.current())?;
//! while let Ok(state) = updates.recv() {
//!     println!("tip moved to {:?}", state.tip());
//! }
//! ```

pub mod api;
pub mod error;
pub mod queue;
pub mod repository;
pub mod state;
pub mod stores;
pub mod types;

// Re-exports
pub use api::{
    AnchorEvent, AnchorService, CommitData, ConflictResolution, Dispatcher, Handler, IndexingApi,
    LogLengthResolution, Winner,
};
pub use error::{RepositoryError, Result};
pub use queue::{ExecutionQueue, TaskHandle};
pub use repository::{Repository, RepositoryConfig, StatsSnapshot, Updates};
pub use state::{
    check_capability_expiry, RunningState, StateCache, StateManager, StateSubscription,
};
pub use stores::{AnchorRequestStore, DiskKv, KvStore, MemoryKv, PinStore, StateStore};
pub use types::*;
