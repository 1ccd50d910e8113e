use stratum_common::RowKey;
use stratum_transaction::{Timestamp, TxnId};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("write conflict on row {row} for {writer}: {reason}")]
    WriteConflict {
        row: RowKey,
        writer: TxnId,
        reason: ConflictReason,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    #[error("current version is uncommitted, written by {0}")]
    Uncommitted(TxnId),
    #[error("current version was committed by {writer} at {commit_ts}, after the snapshot")]
    CommittedAfterSnapshot { writer: TxnId, commit_ts: Timestamp },
}
