//! Live state management: the observable running state, the cache that
//! holds running states in memory, and the manager that mutates them.

mod cache;
mod manager;
mod running;

pub use cache::{EvictCallback, StateCache};
pub use manager::{check_capability_expiry, LoadFn, StateManager};
pub use running::{RunningState, StateSubscription};
