//! Per-isolation-level snapshot policy and serializable validation.
//!
//! | level           | snapshot                        | write check               | commit check |
//! |-----------------|---------------------------------|---------------------------|--------------|
//! | read committed  | fresh per statement, monotonic  | no dirty writes           | none         |
//! | repeatable read | first statement, then frozen    | + first-committer-wins    | none         |
//! | serializable    | first statement, then frozen    | + first-committer-wins    | read/write sets |

use std::collections::HashSet;
use std::sync::Arc;

use stratum_common::{KeyRange, RowKey};
use stratum_storage::WriteCheck;
use stratum_transaction::{EngineContext, IsolationLevel, Snapshot, Timestamp, TxnId};
use thiserror::Error;

use crate::txn_manager::ActiveTxn;

/// Rows and ranges read by a serializable transaction.
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    rows: HashSet<RowKey>,
    ranges: Vec<KeyRange>,
}

impl ReadSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_row(&mut self, row: &RowKey) {
        if !self.rows.contains(row) {
            self.rows.insert(row.clone());
        }
    }

    pub fn record_range(&mut self, range: KeyRange) {
        if !self.ranges.contains(&range) {
            self.ranges.push(range);
        }
    }

    /// Returns true if `row` was read, either directly or as part of a scanned range.
    pub fn contains(&self, row: &RowKey) -> bool {
        self.rows.contains(row) || self.ranges.iter().any(|range| range.contains(row))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.ranges.is_empty()
    }
}

/// What a committed transaction leaves behind for serializable validation.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub txn: TxnId,
    pub commit_ts: Timestamp,
    pub writes: Vec<RowKey>,
    /// Present for serializable transactions only.
    pub reads: Option<ReadSet>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationConflict {
    #[error("{row} was read here and written by {writer}, which committed after the snapshot")]
    ReadWrite { writer: TxnId, row: RowKey },

    #[error("{row} was written here and read by {reader}, which committed after the snapshot")]
    WriteRead { reader: TxnId, row: RowKey },
}

pub struct IsolationController {
    ctx: Arc<EngineContext>,
}

impl IsolationController {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Returns the snapshot the next statement of `txn` reads from.
    ///
    /// Frozen levels reuse `current` once it exists. Read committed captures a new snapshot on
    /// every call, never older than `current`.
    pub fn statement_snapshot(&self, txn: &ActiveTxn, current: Option<Snapshot>) -> Snapshot {
        if let Some(snapshot) = current.filter(|_| txn.isolation().freezes_snapshot()) {
            return snapshot;
        }
        self.ctx.capture_snapshot(txn.id(), |fresh| {
            let snapshot = match current {
                Some(previous) if previous.ts() > fresh.ts() => previous,
                _ => fresh,
            };
            txn.publish_snapshot(snapshot.ts());
            snapshot
        })
    }

    pub fn write_check(&self, level: IsolationLevel, snapshot: Snapshot) -> WriteCheck {
        WriteCheck {
            snapshot,
            first_committer_wins: level.first_committer_wins(),
        }
    }

    pub fn track_row(&self, level: IsolationLevel, reads: &mut ReadSet, row: &RowKey) {
        if level.validates_reads() {
            reads.record_row(row);
        }
    }

    pub fn track_range(&self, level: IsolationLevel, reads: &mut ReadSet, range: &KeyRange) {
        if level.validates_reads() {
            reads.record_range(range.clone());
        }
    }

    /// Checks a serializable transaction against every transaction that committed after its
    /// snapshot. Fails if either side wrote something the other read.
    pub fn validate_commit<'a>(
        &self,
        reads: &ReadSet,
        writes: &[RowKey],
        concurrent: impl IntoIterator<Item = &'a CommitRecord>,
    ) -> Result<(), SerializationConflict> {
        for record in concurrent {
            if let Some(row) = record.writes.iter().find(|row| reads.contains(row)) {
                return Err(SerializationConflict::ReadWrite {
                    writer: record.txn,
                    row: row.clone(),
                });
            }
            if let Some(other_reads) = &record.reads {
                if let Some(row) = writes.iter().find(|row| other_reads.contains(row)) {
                    return Err(SerializationConflict::WriteRead {
                        reader: record.txn,
                        row: row.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
