//! An in-memory multi-version concurrency control engine.
//!
//! Transactions read from snapshots, write new row versions under row locks and commit in a
//! single total order. Three isolation levels are supported, from read committed to
//! serializable, together with explicit row and table locks, savepoints and deadlock detection.
//!
//! ```no_run
//! use stratum::{Engine, EngineConfig, IsolationLevel, RowKey};
//!
//! let engine = Engine::start(EngineConfig::default())?;
//! let txn = engine.begin(IsolationLevel::RepeatableRead)?;
//! engine.write(&txn, RowKey::new(1, "alice"), "100")?;
//! engine.commit(txn)?;
//! # Ok::<(), stratum::Error>(())
//! ```

mod engine;
mod error;
pub mod gc;
pub mod isolation;
mod transaction;
pub mod txn_manager;

pub use engine::{Engine, EngineStats, LockOutcome, WaitPolicy};
pub use error::{
    Error, Result, SQLSTATE_DEADLOCK_DETECTED, SQLSTATE_INTERNAL_ERROR,
    SQLSTATE_INVALID_TRANSACTION_STATE, SQLSTATE_LOCK_NOT_AVAILABLE,
    SQLSTATE_SERIALIZATION_FAILURE,
};
pub use gc::GcStats;
pub use isolation::{ReadSet, SerializationConflict};
pub use stratum_common::{EngineConfig, KeyRange, RowKey, TableId};
pub use stratum_lock::{LockMode, Resource};
pub use stratum_transaction::{IsolationLevel, Snapshot, Timestamp, TxnId, TxnState};
pub use transaction::{Savepoint, TxnHandle};
