//! Row- and table-level locking with FIFO wait queues and wait-for graph deadlock detection.

pub mod deadlock;
pub mod error;
pub mod manager;
pub mod mode;
pub mod resource;

pub use deadlock::{DeadlockCycle, DeadlockDetector, WaitForGraph};
pub use error::{LockError, LockResult};
pub use manager::{LockGrant, LockManager, LockManagerStats};
pub use mode::{Granularity, LockMode};
pub use resource::Resource;
