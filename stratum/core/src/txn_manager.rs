use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, MutexGuard};
use stratum_transaction::{EngineContext, IsolationLevel, Timestamp, TimestampError, TxnId};
use tracing::debug;

use crate::isolation::CommitRecord;

const NO_SNAPSHOT: u64 = u64::MAX;

/// Registration of a running transaction, shared between the transaction and the manager.
#[derive(Debug)]
pub struct ActiveTxn {
    id: TxnId,
    isolation: IsolationLevel,
    /// Timestamp of the snapshot the transaction currently reads from.
    snapshot_ts: AtomicU64,
}

impl ActiveTxn {
    #[inline]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[inline]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// `None` until the first statement captures a snapshot.
    pub fn snapshot_ts(&self) -> Option<Timestamp> {
        match self.snapshot_ts.load(Ordering::Acquire) {
            NO_SNAPSHOT => None,
            raw => Some(Timestamp::with_ts(raw)),
        }
    }

    /// Must be called while the snapshot gate is held, see
    /// [`EngineContext::capture_snapshot`].
    pub(crate) fn publish_snapshot(&self, ts: Timestamp) {
        self.snapshot_ts.store(ts.raw(), Ordering::Release);
    }
}

/// A manager for the lifecycle bookkeeping of transactions.
pub struct TransactionManager {
    ctx: Arc<EngineContext>,
    /// Running transactions.
    active_txns: SkipMap<TxnId, Arc<ActiveTxn>>,
    /// Commit records still needed by serializable validation, keyed by commit timestamp.
    committed: SkipMap<Timestamp, Arc<CommitRecord>>,
    /// Commit lock to enforce serial commit order
    commit_lock: Mutex<()>,
    /// The watermark is the minimum snapshot timestamp of the active transactions.
    /// If there is no active transaction, the watermark is the latest commit timestamp.
    watermark: AtomicU64,
}

impl TransactionManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            active_txns: SkipMap::new(),
            committed: SkipMap::new(),
            commit_lock: Mutex::new(()),
            watermark: AtomicU64::new(Timestamp::ZERO.raw()),
        }
    }

    /// Allocates a transaction id, marks it active and registers it.
    pub fn begin(&self, isolation: IsolationLevel) -> Result<Arc<ActiveTxn>, TimestampError> {
        let id = self.ctx.begin_txn()?;
        let txn = Arc::new(ActiveTxn {
            id,
            isolation,
            snapshot_ts: AtomicU64::new(NO_SNAPSHOT),
        });
        self.active_txns.insert(id, txn.clone());
        debug!(txn = %id, ?isolation, "transaction started");
        Ok(txn)
    }

    /// Removes a committed or rolled back transaction from the active set.
    pub fn finish(&self, txn: TxnId) {
        self.active_txns.remove(&txn);
    }

    pub fn active_count(&self) -> usize {
        self.active_txns.len()
    }

    pub(crate) fn commit_lock(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    pub(crate) fn record_commit(&self, record: CommitRecord) {
        self.committed.insert(record.commit_ts, Arc::new(record));
    }

    /// Commit records of transactions that committed strictly after `ts`.
    pub fn committed_after(&self, ts: Timestamp) -> Vec<Arc<CommitRecord>> {
        self.committed
            .range((Bound::Excluded(ts), Bound::Unbounded))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn pending_commit_records(&self) -> usize {
        self.committed.len()
    }

    /// Drops commit records older than `boundary`. Returns how many were dropped.
    pub fn prune_commit_records(&self, boundary: Timestamp) -> usize {
        let mut dropped = 0;
        while let Some(entry) = self.committed.front() {
            if *entry.key() >= boundary {
                break;
            }
            entry.remove();
            dropped += 1;
        }
        dropped
    }

    /// Recomputes the watermark from the active transactions.
    ///
    /// Call with snapshot capture paused so no transaction can publish a snapshot below the
    /// returned value afterwards.
    pub fn update_watermark(&self) -> Timestamp {
        let min_ts = self
            .active_txns
            .iter()
            .filter_map(|entry| entry.value().snapshot_ts())
            .min()
            .unwrap_or_else(|| self.ctx.latest_commit_ts())
            .max(self.low_watermark());
        self.watermark.store(min_ts.raw(), Ordering::SeqCst);
        min_ts
    }

    pub fn low_watermark(&self) -> Timestamp {
        Timestamp::with_ts(self.watermark.load(Ordering::Acquire))
    }
}
