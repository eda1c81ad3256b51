//! Persistence collaborators: key-value backend, state records, pin flags,
//! and durable anchor requests.

mod anchor_requests;
mod kv;
mod pin_store;
mod state_store;

pub use anchor_requests::AnchorRequestStore;
pub use kv::{DiskKv, KvStore, MemoryKv};
pub use pin_store::PinStore;
pub use state_store::StateStore;
