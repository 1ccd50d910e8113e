//! The public entry point: an in-memory MVCC engine with row and table locking.

use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use stratum_common::{EngineConfig, KeyRange, RowKey, TableId};
use stratum_lock::{DeadlockDetector, LockManager, LockMode, Resource};
use stratum_storage::VersionStore;
use stratum_transaction::{EngineContext, IsolationLevel, Timestamp, TxnId};
use tracing::info;

use crate::error::{Error, Result};
use crate::gc::{GarbageCollector, GcStats, GcWorker};
use crate::isolation::IsolationController;
use crate::transaction::TxnHandle;
use crate::txn_manager::TransactionManager;

/// What a lock request does when the lock is not immediately available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Wait until granted, the lock timeout elapses, or the transaction becomes a deadlock victim
    #[default]
    Block,
    /// Fail with `55P03` instead of waiting
    NoWait,
    /// Report the resource as skipped instead of waiting
    SkipLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock is held, in the returned mode or a stronger one.
    Acquired(LockMode),
    Skipped,
}

/// Components every transaction of one engine shares.
pub(crate) struct EngineShared {
    pub(crate) ctx: Arc<EngineContext>,
    pub(crate) store: Arc<VersionStore>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) txns: Arc<TransactionManager>,
    pub(crate) isolation: IsolationController,
    pub(crate) gc: Arc<GarbageCollector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub active_transactions: usize,
    pub latest_commit_ts: Timestamp,
    pub watermark: Timestamp,
    pub pending_commit_records: usize,
    pub versions: usize,
    pub lock_waits: u64,
    pub lock_timeouts: u64,
    pub deadlock_victims: u64,
}

pub struct Engine {
    shared: Arc<EngineShared>,
    _deadlock_detector: Option<DeadlockDetector>,
    _gc_worker: Option<GcWorker>,
}

impl Engine {
    /// Creates an engine without background threads. Deadlocks are still detected whenever a
    /// lock request is about to block.
    pub fn new(config: EngineConfig) -> Self {
        let ctx = Arc::new(EngineContext::new(config));
        let store = Arc::new(VersionStore::new(ctx.clone()));
        let txns = Arc::new(TransactionManager::new(ctx.clone()));
        let shared = EngineShared {
            locks: Arc::new(LockManager::new(ctx.clone())),
            isolation: IsolationController::new(ctx.clone()),
            gc: Arc::new(GarbageCollector::new(ctx.clone(), store.clone(), txns.clone())),
            ctx,
            store,
            txns,
        };
        Self {
            shared: Arc::new(shared),
            _deadlock_detector: None,
            _gc_worker: None,
        }
    }

    /// Creates an engine and spawns the deadlock detector and, if `gc_interval` is set, the
    /// garbage collector.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let mut engine = Self::new(config);
        let config = engine.config().clone();
        engine._deadlock_detector = Some(DeadlockDetector::spawn(
            engine.shared.locks.clone(),
            config.deadlock_timeout,
        )?);
        if let Some(interval) = config.gc_interval {
            engine._gc_worker = Some(GcWorker::spawn(engine.shared.gc.clone(), interval)?);
        }
        info!(?config, "engine started");
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        self.shared.ctx.config()
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Result<TxnHandle> {
        let active = self.shared.txns.begin(isolation)?;
        Ok(TxnHandle::new(self.shared.clone(), active))
    }

    fn check_owner(&self, txn: &TxnHandle) -> Result<()> {
        if txn.belongs_to(&self.shared) {
            Ok(())
        } else {
            Err(Error::invalid_state(
                txn.id(),
                "transaction belongs to another engine",
            ))
        }
    }

    pub fn read(&self, txn: &TxnHandle, row: &RowKey) -> Result<Option<Bytes>> {
        self.check_owner(txn)?;
        txn.inner().read(row)
    }

    pub fn write(&self, txn: &TxnHandle, row: RowKey, payload: impl Into<Bytes>) -> Result<()> {
        self.check_owner(txn)?;
        txn.inner().write(row, Some(payload.into()))
    }

    pub fn delete(&self, txn: &TxnHandle, row: RowKey) -> Result<()> {
        self.check_owner(txn)?;
        txn.inner().write(row, None)
    }

    /// Visible rows of `table` whose keys fall in `keys`, in key order.
    pub fn scan(
        &self,
        txn: &TxnHandle,
        table: TableId,
        keys: impl RangeBounds<Bytes>,
    ) -> Result<Vec<(RowKey, Bytes)>> {
        self.check_owner(txn)?;
        let range = KeyRange::new(table, keys.start_bound().cloned(), keys.end_bound().cloned());
        txn.inner().scan(&range)
    }

    pub fn lock(
        &self,
        txn: &TxnHandle,
        resource: Resource,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<LockOutcome> {
        self.check_owner(txn)?;
        txn.inner().lock(&resource, mode, policy)
    }

    /// Locks each of `resources` and returns the ones now held. Only [`WaitPolicy::SkipLocked`]
    /// can return fewer than requested.
    pub fn lock_all(
        &self,
        txn: &TxnHandle,
        resources: &[Resource],
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<Vec<Resource>> {
        self.check_owner(txn)?;
        txn.inner().lock_all(resources, mode, policy)
    }

    /// Commits `txn` and returns its commit timestamp. On error the transaction is rolled back.
    pub fn commit(&self, txn: TxnHandle) -> Result<Timestamp> {
        self.check_owner(&txn)?;
        txn.inner().commit()
    }

    pub fn rollback(&self, txn: &TxnHandle) {
        if txn.belongs_to(&self.shared) {
            txn.inner().rollback();
        }
    }

    pub fn savepoint(&self, txn: &TxnHandle, name: &str) -> Result<()> {
        self.check_owner(txn)?;
        txn.inner().savepoint(name)
    }

    pub fn rollback_to(&self, txn: &TxnHandle, name: &str) -> Result<()> {
        self.check_owner(txn)?;
        txn.inner().rollback_to(name)
    }

    pub fn release_savepoint(&self, txn: &TxnHandle, name: &str) -> Result<()> {
        self.check_owner(txn)?;
        txn.inner().release_savepoint(name)
    }

    /// Runs a garbage collection sweep now.
    pub fn gc(&self) -> GcStats {
        self.shared.gc.sweep()
    }

    /// Runs a deadlock detection pass now and returns the aborted victims.
    pub fn detect_deadlocks(&self) -> Vec<TxnId> {
        self.shared.locks.detect_deadlocks()
    }

    /// Locks currently held by `txn`.
    pub fn locks_held(&self, txn: &TxnHandle) -> Vec<(Resource, LockMode)> {
        self.shared.locks.held_by(txn.id())
    }

    pub fn stats(&self) -> EngineStats {
        let locks = self.shared.locks.stats();
        EngineStats {
            active_transactions: self.shared.txns.active_count(),
            latest_commit_ts: self.shared.ctx.latest_commit_ts(),
            watermark: self.shared.txns.low_watermark(),
            pending_commit_records: self.shared.txns.pending_commit_records(),
            versions: self.shared.store.version_count(),
            lock_waits: locks.waits,
            lock_timeouts: locks.timeouts,
            deadlock_victims: locks.deadlock_victims,
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
