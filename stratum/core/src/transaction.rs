use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use stratum_common::{KeyRange, RowKey};
use stratum_lock::{LockMode, Resource};
use stratum_storage::VersionRef;
use stratum_transaction::{IsolationLevel, Snapshot, Timestamp, TxnId, TxnState};
use tracing::{debug, info};

use crate::engine::{EngineShared, LockOutcome, WaitPolicy};
use crate::error::{Error, Result};
use crate::isolation::{CommitRecord, ReadSet};
use crate::txn_manager::ActiveTxn;

/// A named position inside a transaction that can be rolled back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
    pub write_set_len: usize,
    pub undo_len: usize,
}

/// State only the transaction itself touches.
#[derive(Debug, Default)]
struct TxnLocal {
    snapshot: Option<Snapshot>,
    /// Rows written, in first-write order.
    write_set: Vec<RowKey>,
    written: HashSet<RowKey>,
    /// Versions created, oldest first.
    undo_log: Vec<VersionRef>,
    reads: ReadSet,
    savepoints: Vec<Savepoint>,
    finished: bool,
}

impl TxnLocal {
    fn record_write(&mut self, row: RowKey, version: VersionRef) {
        self.undo_log.push(version);
        if self.written.insert(row.clone()) {
            self.write_set.push(row);
        }
    }
}

pub(crate) struct Transaction {
    shared: Arc<EngineShared>,
    active: Arc<ActiveTxn>,
    local: Mutex<TxnLocal>,
    /// Flag to track whether the transaction has been committed or rolled back
    handled: AtomicBool,
}

impl Transaction {
    fn id(&self) -> TxnId {
        self.active.id()
    }

    fn isolation(&self) -> IsolationLevel {
        self.active.isolation()
    }

    fn check_open(&self, local: &TxnLocal) -> Result<()> {
        if local.finished {
            return Err(Error::invalid_state(self.id(), "transaction is already finished"));
        }
        match self.shared.ctx.status().state(self.id()) {
            Some(TxnState::Active) => Ok(()),
            Some(TxnState::Aborted) => Err(Error::invalid_state(
                self.id(),
                "transaction was rolled back",
            )),
            state => Err(Error::invalid_state(
                self.id(),
                format!("transaction is in state {state:?}"),
            )),
        }
    }

    /// Rolls the transaction back before handing out an error that ends it.
    fn guarded<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        op().inspect_err(|err| {
            if err.ends_transaction() {
                info!(txn = %self.id(), sqlstate = err.sqlstate(), %err, "transaction aborted");
                self.rollback();
            }
        })
    }

    fn begin_statement(&self, local: &mut TxnLocal) -> Result<Snapshot> {
        self.check_open(local)?;
        let snapshot = self
            .shared
            .isolation
            .statement_snapshot(&self.active, local.snapshot);
        local.snapshot = Some(snapshot);
        Ok(snapshot)
    }

    pub(crate) fn read(&self, row: &RowKey) -> Result<Option<Bytes>> {
        let mut local = self.local.lock();
        let snapshot = self.begin_statement(&mut local)?;
        let value = self.shared.store.get(row, &snapshot);
        self.shared
            .isolation
            .track_row(self.isolation(), &mut local.reads, row);
        Ok(value)
    }

    pub(crate) fn scan(&self, range: &KeyRange) -> Result<Vec<(RowKey, Bytes)>> {
        let mut local = self.local.lock();
        let snapshot = self.begin_statement(&mut local)?;
        let rows = self.shared.store.scan(range, &snapshot);
        self.shared
            .isolation
            .track_range(self.isolation(), &mut local.reads, range);
        Ok(rows)
    }

    /// Writes a new version of `row`; `None` deletes it.
    pub(crate) fn write(&self, row: RowKey, payload: Option<Bytes>) -> Result<()> {
        self.guarded(|| {
            let snapshot = self.begin_statement(&mut self.local.lock())?;
            self.acquire(&Resource::Table(row.table()), LockMode::RowExclusive, WaitPolicy::Block)?;
            self.acquire(&Resource::Row(row.clone()), LockMode::RowExclusive, WaitPolicy::Block)?;

            let mut local = self.local.lock();
            self.check_open(&local)?;
            let check = self.shared.isolation.write_check(self.isolation(), snapshot);
            let version = self.shared.store.put(&row, payload, check)?;
            local.record_write(row, version);
            Ok(())
        })
    }

    fn acquire(&self, resource: &Resource, mode: LockMode, policy: WaitPolicy) -> Result<LockOutcome> {
        let locks = &self.shared.locks;
        let txn = self.id();
        match policy {
            WaitPolicy::Block => {
                let timeout = self.shared.ctx.config().lock_timeout;
                let grant = locks.acquire(txn, resource, mode, timeout)?;
                Ok(LockOutcome::Acquired(grant.mode))
            }
            WaitPolicy::NoWait => match locks.try_acquire(txn, resource, mode) {
                Some(grant) => Ok(LockOutcome::Acquired(grant.mode)),
                None => Err(Error::LockNotAvailable {
                    txn,
                    resource: resource.clone(),
                    mode,
                }),
            },
            WaitPolicy::SkipLocked => Ok(locks
                .try_acquire(txn, resource, mode)
                .map_or(LockOutcome::Skipped, |grant| LockOutcome::Acquired(grant.mode))),
        }
    }

    /// Locks `resource`, taking the table-level intention lock first for rows.
    fn acquire_with_intent(
        &self,
        resource: &Resource,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<LockOutcome> {
        if let Resource::Row(row) = resource {
            let intent = self.acquire(&Resource::Table(row.table()), LockMode::RowShare, policy)?;
            if intent == LockOutcome::Skipped {
                return Ok(LockOutcome::Skipped);
            }
        }
        self.acquire(resource, mode, policy)
    }

    pub(crate) fn lock(
        &self,
        resource: &Resource,
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<LockOutcome> {
        self.guarded(|| {
            self.begin_statement(&mut self.local.lock())?;
            self.acquire_with_intent(resource, mode, policy)
        })
    }

    pub(crate) fn lock_all(
        &self,
        resources: &[Resource],
        mode: LockMode,
        policy: WaitPolicy,
    ) -> Result<Vec<Resource>> {
        self.guarded(|| {
            self.begin_statement(&mut self.local.lock())?;
            if policy != WaitPolicy::SkipLocked {
                for resource in resources {
                    self.acquire_with_intent(resource, mode, policy)?;
                }
                return Ok(resources.to_vec());
            }

            let tables: BTreeSet<_> = resources
                .iter()
                .filter_map(|resource| match resource {
                    Resource::Row(row) => Some(row.table()),
                    Resource::Table(_) => None,
                })
                .collect();
            let mut available = HashSet::new();
            for table in tables {
                let intent = Resource::Table(table);
                if self.acquire(&intent, LockMode::RowShare, policy)? != LockOutcome::Skipped {
                    available.insert(table);
                }
            }
            let candidates: Vec<_> = resources
                .iter()
                .filter(|resource| match resource {
                    Resource::Row(row) => available.contains(&row.table()),
                    Resource::Table(_) => true,
                })
                .collect();
            Ok(self
                .shared
                .locks
                .acquire_skip_incompatible(candidates, mode, self.id())
                .into_iter()
                .map(|grant| grant.resource)
                .collect())
        })
    }

    pub(crate) fn commit(&self) -> Result<Timestamp> {
        let shared = &self.shared;
        let txn = self.id();
        let mut local = self.local.lock();
        self.check_open(&local)?;

        let validates = self.isolation().validates_reads();
        let commit_ts = {
            let _commit = shared.txns.commit_lock();

            if validates {
                if let Err(err) = shared.ctx.status().prepare(txn) {
                    self.abort_locked(&mut local);
                    return Err(Error::invalid_state(txn, err.to_string()));
                }
                if let Some(snapshot) = local.snapshot {
                    let concurrent = shared.txns.committed_after(snapshot.ts());
                    let validated = shared.isolation.validate_commit(
                        &local.reads,
                        &local.write_set,
                        concurrent.iter().map(|record| &**record),
                    );
                    if let Err(conflict) = validated {
                        info!(txn = %txn, %conflict, "serializable validation failed");
                        self.abort_locked(&mut local);
                        return Err(Error::SerializationFailure { txn, conflict });
                    }
                }
            }

            let commit_ts = match shared.ctx.next_commit_ts() {
                Ok(ts) => ts,
                Err(err) => {
                    self.abort_locked(&mut local);
                    return Err(err.into());
                }
            };
            if let Err(err) = shared.ctx.status().commit(txn, commit_ts) {
                // Rolled back from another thread in the meantime.
                self.abort_locked(&mut local);
                return Err(Error::invalid_state(txn, err.to_string()));
            }
            shared.ctx.publish_commit(commit_ts);

            if !local.write_set.is_empty() {
                shared.txns.record_commit(CommitRecord {
                    txn,
                    commit_ts,
                    writes: local.write_set.clone(),
                    reads: validates.then(|| std::mem::take(&mut local.reads)),
                });
            }
            commit_ts
        };

        shared.locks.release_all(txn);
        shared.txns.finish(txn);
        local.finished = true;
        local.undo_log.clear();
        local.savepoints.clear();
        self.handled.store(true, Ordering::Release);
        debug!(txn = %txn, %commit_ts, writes = local.write_set.len(), "transaction committed");
        drop(local);

        shared.gc.maybe_sweep();
        Ok(commit_ts)
    }

    /// Rolls back the transaction. Safe to call from any thread and any number of times.
    pub(crate) fn rollback(&self) {
        let txn = self.id();
        // Hide the versions and interrupt a lock wait before waiting for the owner thread.
        self.shared.ctx.status().abort(txn);
        self.shared.locks.cancel_wait(txn);
        let mut local = self.local.lock();
        self.abort_locked(&mut local);
    }

    fn abort_locked(&self, local: &mut TxnLocal) {
        if local.finished {
            return;
        }
        let txn = self.id();
        self.shared.ctx.status().abort(txn);
        for version in local.undo_log.drain(..).rev() {
            self.shared.store.undo(&version, txn);
        }
        self.shared.locks.release_all(txn);
        self.shared.txns.finish(txn);
        local.finished = true;
        local.savepoints.clear();
        self.handled.store(true, Ordering::Release);
        debug!(txn = %txn, "transaction rolled back");
    }

    pub(crate) fn savepoint(&self, name: &str) -> Result<()> {
        let mut local = self.local.lock();
        self.check_open(&local)?;
        let savepoint = Savepoint {
            name: name.to_string(),
            write_set_len: local.write_set.len(),
            undo_len: local.undo_log.len(),
        };
        local.savepoints.push(savepoint);
        Ok(())
    }

    fn find_savepoint(&self, local: &TxnLocal, name: &str) -> Result<usize> {
        local
            .savepoints
            .iter()
            .rposition(|savepoint| savepoint.name == name)
            .ok_or_else(|| {
                Error::invalid_state(self.id(), format!("savepoint \"{name}\" does not exist"))
            })
    }

    /// Undoes everything written after savepoint `name`. The savepoint itself survives, later
    /// ones are discarded. Locks taken since are kept.
    pub(crate) fn rollback_to(&self, name: &str) -> Result<()> {
        let mut local = self.local.lock();
        self.check_open(&local)?;
        let pos = self.find_savepoint(&local, name)?;
        local.savepoints.truncate(pos + 1);
        let Savepoint {
            write_set_len,
            undo_len,
            ..
        } = local.savepoints[pos].clone();

        let TxnLocal {
            write_set,
            written,
            undo_log,
            ..
        } = &mut *local;
        for version in undo_log.drain(undo_len..).rev() {
            self.shared.store.undo(&version, self.id());
        }
        for row in write_set.drain(write_set_len..) {
            written.remove(&row);
        }
        debug!(txn = %self.id(), savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    /// Forgets savepoint `name` and every savepoint created after it.
    pub(crate) fn release_savepoint(&self, name: &str) -> Result<()> {
        let mut local = self.local.lock();
        self.check_open(&local)?;
        let pos = self.find_savepoint(&local, name)?;
        local.savepoints.truncate(pos);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.handled.load(Ordering::Acquire) {
            self.rollback();
        }
        // With the last handle gone nothing can act for this transaction anymore and all of its
        // versions are gone, so its aborted status no longer needs to be remembered.
        let status = self.shared.ctx.status();
        if status.state(self.id()) == Some(TxnState::Aborted) {
            status.forget(self.id());
        }
    }
}

/// A client's handle to a running transaction.
///
/// Clones share the transaction, so another thread can roll it back while it waits for a lock.
/// When the last clone is dropped, a transaction that was neither committed nor rolled back is
/// rolled back.
#[derive(Clone)]
pub struct TxnHandle(Arc<Transaction>);

impl TxnHandle {
    pub(crate) fn new(shared: Arc<EngineShared>, active: Arc<ActiveTxn>) -> Self {
        Self(Arc::new(Transaction {
            shared,
            active,
            local: Mutex::new(TxnLocal::default()),
            handled: AtomicBool::new(false),
        }))
    }

    pub(crate) fn inner(&self) -> &Transaction {
        &self.0
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<EngineShared>) -> bool {
        Arc::ptr_eq(&self.0.shared, shared)
    }

    pub fn id(&self) -> TxnId {
        self.0.id()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.0.isolation()
    }

    /// Current state. A committed transaction the engine no longer tracks reports `Committed`.
    pub fn state(&self) -> TxnState {
        self.0
            .shared
            .ctx
            .status()
            .state(self.id())
            .unwrap_or(TxnState::Committed)
    }

    /// The snapshot of the last statement, if any ran yet.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.0.local.lock().snapshot
    }

    /// Rows written so far, in first-write order.
    pub fn write_set(&self) -> Vec<RowKey> {
        self.0.local.lock().write_set.clone()
    }

    pub fn savepoints(&self) -> Vec<Savepoint> {
        self.0.local.lock().savepoints.clone()
    }
}

impl fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnHandle")
            .field("id", &self.id())
            .field("isolation", &self.isolation_level())
            .finish()
    }
}
