//! Common transaction infrastructure for the stratum engine.
//!
//! This crate provides the identifiers, state machine, snapshot visibility rules and shared
//! engine context that the storage, lock and core layers build on.

pub mod context;
pub mod error;
pub mod snapshot;
pub mod status;
pub mod timestamp;
pub mod transaction;

pub use context::EngineContext;
pub use error::{StatusError, TimestampError};
pub use snapshot::Snapshot;
pub use status::{Resolution, TxnStatus, TxnStatusTable};
pub use timestamp::{CommitTsGenerator, Timestamp, TransactionIdGenerator, TxnId};
pub use transaction::{IsolationLevel, TxnState};
