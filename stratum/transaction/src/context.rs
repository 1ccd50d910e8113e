//! Engine-wide shared state, created once at startup and injected into every component.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use stratum_common::EngineConfig;
use tracing::debug;

use crate::error::TimestampError;
use crate::snapshot::Snapshot;
use crate::status::TxnStatusTable;
use crate::timestamp::{CommitTsGenerator, Timestamp, TransactionIdGenerator, TxnId};

pub struct EngineContext {
    config: EngineConfig,
    txn_ids: TransactionIdGenerator,
    commit_ts: CommitTsGenerator,
    /// Highest commit timestamp whose transaction is already marked committed in `status`.
    latest_commit_ts: AtomicU64,
    status: TxnStatusTable,
    /// Snapshot capture holds this shared; computing a GC boundary holds it exclusively.
    snapshot_gate: RwLock<()>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            txn_ids: TransactionIdGenerator::new(),
            commit_ts: CommitTsGenerator::new(),
            latest_commit_ts: AtomicU64::new(Timestamp::ZERO.raw()),
            status: TxnStatusTable::new(),
            snapshot_gate: RwLock::new(()),
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn status(&self) -> &TxnStatusTable {
        &self.status
    }

    /// Allocates a new transaction id and registers it as active.
    pub fn begin_txn(&self) -> Result<TxnId, TimestampError> {
        let txn = self.txn_ids.next()?;
        self.status.register(txn);
        Ok(txn)
    }

    /// Allocates the next commit timestamp. Callers serialize commits, so timestamps are
    /// published in allocation order.
    pub fn next_commit_ts(&self) -> Result<Timestamp, TimestampError> {
        self.commit_ts.next()
    }

    /// Makes a commit visible to snapshots taken from now on. The committing transaction must
    /// already be marked committed in the status table.
    pub fn publish_commit(&self, commit_ts: Timestamp) {
        self.latest_commit_ts
            .fetch_max(commit_ts.raw(), Ordering::SeqCst);
    }

    #[inline]
    pub fn latest_commit_ts(&self) -> Timestamp {
        Timestamp::with_ts(self.latest_commit_ts.load(Ordering::SeqCst))
    }

    /// Captures a snapshot for `owner` and hands it to `register` while the snapshot gate is
    /// held, so a concurrent GC boundary computation either sees the registration or runs
    /// entirely before the capture.
    pub fn capture_snapshot<R>(&self, owner: TxnId, register: impl FnOnce(Snapshot) -> R) -> R {
        let _gate = self.snapshot_gate.read();
        let snapshot = Snapshot::new(owner, self.latest_commit_ts());
        debug!(txn = %owner, ts = %snapshot.ts(), "captured snapshot");
        register(snapshot)
    }

    /// Runs `compute` with snapshot capture excluded.
    pub fn with_snapshots_paused<R>(&self, compute: impl FnOnce() -> R) -> R {
        let _gate = self.snapshot_gate.write();
        compute()
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
