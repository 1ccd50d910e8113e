use std::time::Duration;

use stratum_transaction::TxnId;
use thiserror::Error;

use crate::mode::LockMode;
use crate::resource::Resource;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{txn} timed out after {waited:?} waiting for {mode:?} on {resource}")]
    Timeout {
        txn: TxnId,
        resource: Resource,
        mode: LockMode,
        waited: Duration,
    },

    #[error("{0} was chosen as deadlock victim")]
    DeadlockVictim(TxnId),

    #[error("lock wait of {0} was cancelled by rollback")]
    Aborted(TxnId),
}
