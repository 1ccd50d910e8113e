use std::time::Duration;

use miette::Diagnostic;
use stratum_lock::{LockError, LockMode, Resource};
use stratum_storage::StorageError;
use stratum_transaction::{TimestampError, TxnId};
use thiserror::Error;

use crate::isolation::SerializationConflict;

pub const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
pub const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
pub const SQLSTATE_INVALID_TRANSACTION_STATE: &str = "25000";
pub const SQLSTATE_INTERNAL_ERROR: &str = "XX000";

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("could not serialize access due to concurrent update: {0}")]
    #[diagnostic(code("40001"), help("retry the transaction from the beginning"))]
    WriteConflict(#[source] StorageError),

    #[error("could not serialize access due to read/write dependencies among transactions: {conflict}")]
    #[diagnostic(code("40001"), help("retry the transaction from the beginning"))]
    SerializationFailure {
        txn: TxnId,
        #[source]
        conflict: SerializationConflict,
    },

    #[error("deadlock detected, {0} was aborted")]
    #[diagnostic(code("40P01"), help("retry the transaction from the beginning"))]
    DeadlockVictim(TxnId),

    #[error("{txn} could not obtain lock on {resource} within {waited:?}")]
    #[diagnostic(code("55P03"))]
    LockTimeout {
        txn: TxnId,
        resource: Resource,
        waited: Duration,
    },

    #[error("{txn} could not obtain {mode:?} lock on {resource}")]
    #[diagnostic(code("55P03"))]
    LockNotAvailable {
        txn: TxnId,
        resource: Resource,
        mode: LockMode,
    },

    #[error("{txn}: {detail}")]
    #[diagnostic(code("25000"))]
    InvalidState { txn: TxnId, detail: String },

    #[error("transaction counters exhausted")]
    #[diagnostic(code("XX000"))]
    Timestamp(#[from] TimestampError),

    #[error("failed to spawn background worker")]
    #[diagnostic(code("XX000"))]
    Spawn(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_state(txn: TxnId, detail: impl Into<String>) -> Self {
        Error::InvalidState {
            txn,
            detail: detail.into(),
        }
    }

    /// The PostgreSQL error code of this error.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::WriteConflict(_) | Error::SerializationFailure { .. } => {
                SQLSTATE_SERIALIZATION_FAILURE
            }
            Error::DeadlockVictim(_) => SQLSTATE_DEADLOCK_DETECTED,
            Error::LockTimeout { .. } | Error::LockNotAvailable { .. } => {
                SQLSTATE_LOCK_NOT_AVAILABLE
            }
            Error::InvalidState { .. } => SQLSTATE_INVALID_TRANSACTION_STATE,
            Error::Timestamp(_) | Error::Spawn(_) => SQLSTATE_INTERNAL_ERROR,
        }
    }

    /// Whether running the whole transaction again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriteConflict(_)
                | Error::SerializationFailure { .. }
                | Error::DeadlockVictim(_)
                | Error::LockTimeout { .. }
                | Error::LockNotAvailable { .. }
        )
    }

    /// Whether the transaction has already been rolled back when this error is returned.
    pub fn ends_transaction(&self) -> bool {
        matches!(
            self,
            Error::WriteConflict(_) | Error::SerializationFailure { .. } | Error::DeadlockVictim(_)
        )
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::WriteConflict(err)
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                txn,
                resource,
                waited,
                ..
            } => Error::LockTimeout {
                txn,
                resource,
                waited,
            },
            LockError::DeadlockVictim(txn) => Error::DeadlockVictim(txn),
            LockError::Aborted(txn) => {
                Error::invalid_state(txn, "transaction was rolled back while waiting for a lock")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
