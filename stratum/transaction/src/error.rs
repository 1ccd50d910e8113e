use thiserror::Error;

use crate::timestamp::TxnId;
use crate::transaction::TxnState;

#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("commit-ts overflow, reached {0}")]
    CommitTsOverflow(u64),

    #[error("txn-id overflow, reached {0}")]
    TxnIdOverflow(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("{0} is not registered")]
    UnknownTransaction(TxnId),

    #[error("{txn} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        txn: TxnId,
        from: TxnState,
        to: TxnState,
    },
}
