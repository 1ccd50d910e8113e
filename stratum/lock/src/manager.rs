//! The lock table.
//!
//! All lock state lives behind one mutex. Each resource has a FIFO wait queue and its own
//! condition variable; a blocked `acquire` sleeps on the condvar of the resource it waits for
//! and re-checks its wait slot on every wake. Whoever grants, cancels or aborts a waiter
//! updates that slot first and then notifies.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use stratum_transaction::{EngineContext, Resolution, TxnId};
use tracing::{debug, info, warn};

use crate::deadlock::WaitForGraph;
use crate::error::{LockError, LockResult};
use crate::mode::{Granularity, LockMode};
use crate::resource::Resource;

/// A lock held by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub resource: Resource,
    /// The mode now held, which may be stronger than the one requested.
    pub mode: LockMode,
    pub holder: TxnId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitStatus {
    Waiting,
    Granted,
    Victim,
    Cancelled,
}

#[derive(Debug)]
struct Waiter {
    txn: TxnId,
    /// Mode the waiter will hold once granted (joined with what it already holds).
    mode: LockMode,
    upgrade: bool,
}

#[derive(Debug)]
struct WaitSlot {
    resource: Resource,
    status: WaitStatus,
    wait_start: Instant,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: Vec<(TxnId, LockMode)>,
    queue: VecDeque<Waiter>,
    cond: Arc<Condvar>,
}

impl LockEntry {
    fn held_mode(&self, txn: TxnId) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(holder, _)| *holder == txn)
            .map(|(_, mode)| *mode)
    }

    fn compatible_with_holders(&self, txn: TxnId, mode: LockMode, granularity: Granularity) -> bool {
        self.holders
            .iter()
            .all(|(holder, held)| *holder == txn || held.is_compatible_with(mode, granularity))
    }

    /// Records `txn` as holding `mode`. Returns true if `txn` did not hold the resource before.
    fn set_holder(&mut self, txn: TxnId, mode: LockMode) -> bool {
        match self.holders.iter_mut().find(|(holder, _)| *holder == txn) {
            Some((_, held)) => {
                *held = mode;
                false
            }
            None => {
                self.holders.push((txn, mode));
                true
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    entries: HashMap<Resource, LockEntry>,
    /// Resources held by each transaction.
    held: HashMap<TxnId, Vec<Resource>>,
    /// Slot of every transaction currently inside a blocking `acquire`.
    waits: HashMap<TxnId, WaitSlot>,
}

impl LockTable {
    /// Grants `mode` right away if nothing stands in the way.
    fn try_grant(&mut self, txn: TxnId, resource: &Resource, mode: LockMode) -> Option<LockGrant> {
        let LockTable { entries, held, .. } = &mut *self;
        let entry = entries.entry(resource.clone()).or_default();
        let current = entry.held_mode(txn);
        if let Some(current) = current.filter(|current| current.covers(mode)) {
            return Some(LockGrant {
                resource: resource.clone(),
                mode: current,
                holder: txn,
            });
        }

        let target = current.map_or(mode, |current| current.join(mode));
        // Upgrades may pass queued waiters; new requests never do.
        let queue_clear = current.is_some() || entry.queue.is_empty();
        if queue_clear && entry.compatible_with_holders(txn, target, resource.granularity()) {
            if entry.set_holder(txn, target) {
                held.entry(txn).or_default().push(resource.clone());
            }
            debug!(txn = %txn, resource = %resource, mode = ?target, "lock granted");
            return Some(LockGrant {
                resource: resource.clone(),
                mode: target,
                holder: txn,
            });
        }

        self.reap(resource);
        None
    }

    fn enqueue(&mut self, txn: TxnId, resource: &Resource, mode: LockMode) {
        let entry = self.entries.entry(resource.clone()).or_default();
        let current = entry.held_mode(txn);
        let waiter = Waiter {
            txn,
            mode: current.map_or(mode, |current| current.join(mode)),
            upgrade: current.is_some(),
        };
        if waiter.upgrade {
            let pos = entry.queue.iter().take_while(|w| w.upgrade).count();
            entry.queue.insert(pos, waiter);
        } else {
            entry.queue.push_back(waiter);
        }
        self.waits.insert(txn, WaitSlot {
            resource: resource.clone(),
            status: WaitStatus::Waiting,
            wait_start: Instant::now(),
        });
    }

    /// Grants queued requests from the head of the queue for as long as they fit.
    fn promote_waiters(&mut self, resource: &Resource) {
        let LockTable {
            entries,
            held,
            waits,
        } = self;
        let Some(entry) = entries.get_mut(resource) else {
            return;
        };
        let granularity = resource.granularity();
        let mut granted = false;
        while let Some(front) = entry.queue.front() {
            if !entry.compatible_with_holders(front.txn, front.mode, granularity) {
                break;
            }
            let Some(waiter) = entry.queue.pop_front() else {
                break;
            };
            if entry.set_holder(waiter.txn, waiter.mode) {
                held.entry(waiter.txn).or_default().push(resource.clone());
            }
            if let Some(slot) = waits.get_mut(&waiter.txn) {
                slot.status = WaitStatus::Granted;
            }
            debug!(txn = %waiter.txn, resource = %resource, mode = ?waiter.mode, "queued lock granted");
            granted = true;
        }
        if granted {
            entry.cond.notify_all();
        }
    }

    /// Ends the pending wait of `txn` with `status` and wakes it. Returns false if `txn` was
    /// not waiting.
    fn interrupt(&mut self, txn: TxnId, status: WaitStatus) -> bool {
        let Some(slot) = self.waits.get_mut(&txn) else {
            return false;
        };
        if slot.status != WaitStatus::Waiting {
            return false;
        }
        slot.status = status;
        let resource = slot.resource.clone();
        if let Some(entry) = self.entries.get_mut(&resource) {
            entry.queue.retain(|w| w.txn != txn);
            entry.cond.notify_all();
        }
        // The removed waiter may have been the one holding up the queue.
        self.promote_waiters(&resource);
        self.reap(&resource);
        true
    }

    /// Drops every grant of `txn` and re-grants the affected queues.
    fn release_grants(&mut self, txn: TxnId) -> usize {
        let Some(resources) = self.held.remove(&txn) else {
            return 0;
        };
        for resource in &resources {
            if let Some(entry) = self.entries.get_mut(resource) {
                entry.holders.retain(|(holder, _)| *holder != txn);
            }
            self.promote_waiters(resource);
            self.reap(resource);
        }
        resources.len()
    }

    fn reap(&mut self, resource: &Resource) {
        if let Entry::Occupied(entry) = self.entries.entry(resource.clone()) {
            if entry.get().is_idle() {
                entry.remove();
            }
        }
    }

    fn wait_status(&self, txn: TxnId) -> Option<WaitStatus> {
        self.waits.get(&txn).map(|slot| slot.status)
    }

    /// Reports every wait-for edge: a waiter waits for each conflicting holder and for every
    /// waiter queued ahead of it. Queues are granted strictly from the head, so a request
    /// compatible with everything still waits behind a blocked one.
    pub(crate) fn for_each_wait_edge(&self, mut edge: impl FnMut(TxnId, TxnId)) {
        for (resource, entry) in &self.entries {
            let granularity = resource.granularity();
            for (pos, waiter) in entry.queue.iter().enumerate() {
                for (holder, held) in &entry.holders {
                    if *holder != waiter.txn && !held.is_compatible_with(waiter.mode, granularity) {
                        edge(waiter.txn, *holder);
                    }
                }
                for ahead in entry.queue.iter().take(pos) {
                    if ahead.txn != waiter.txn {
                        edge(waiter.txn, ahead.txn);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    waits: AtomicU64,
    timeouts: AtomicU64,
    deadlock_victims: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockManagerStats {
    pub waits: u64,
    pub timeouts: u64,
    pub deadlock_victims: u64,
}

pub struct LockManager {
    ctx: Arc<EngineContext>,
    table: Mutex<LockTable>,
    counters: Counters,
}

impl LockManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            table: Mutex::new(LockTable::default()),
            counters: Counters::default(),
        }
    }

    /// Acquires `mode` on `resource` for `txn`, blocking while it conflicts.
    ///
    /// Runs deadlock detection before going to sleep. `timeout == None` waits until the lock
    /// is granted, the transaction is picked as a deadlock victim, or its wait is cancelled.
    pub fn acquire(
        &self,
        txn: TxnId,
        resource: &Resource,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> LockResult<LockGrant> {
        let mut table = self.table.lock();
        if self.ctx.status().resolve(txn) == Resolution::Aborted {
            return Err(LockError::Aborted(txn));
        }
        if let Some(grant) = table.try_grant(txn, resource, mode) {
            return Ok(grant);
        }

        table.enqueue(txn, resource, mode);
        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        debug!(txn = %txn, resource = %resource, mode = ?mode, "waiting for lock");
        self.resolve_deadlocks(&mut table);

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match table.wait_status(txn) {
                Some(WaitStatus::Waiting) => {}
                Some(WaitStatus::Granted) => {
                    table.waits.remove(&txn);
                    let mode = table
                        .entries
                        .get(resource)
                        .and_then(|entry| entry.held_mode(txn))
                        .unwrap_or(mode);
                    return Ok(LockGrant {
                        resource: resource.clone(),
                        mode,
                        holder: txn,
                    });
                }
                Some(WaitStatus::Victim) => {
                    table.waits.remove(&txn);
                    return Err(LockError::DeadlockVictim(txn));
                }
                Some(WaitStatus::Cancelled) | None => {
                    table.waits.remove(&txn);
                    return Err(LockError::Aborted(txn));
                }
            }

            let Some(cond) = table.entries.get(resource).map(|entry| entry.cond.clone()) else {
                table.waits.remove(&txn);
                return Err(LockError::Aborted(txn));
            };
            match deadline {
                None => cond.wait(&mut table),
                Some(deadline) => {
                    let timed_out = cond.wait_until(&mut table, deadline).timed_out();
                    if timed_out && table.wait_status(txn) == Some(WaitStatus::Waiting) {
                        let waited = table
                            .waits
                            .get(&txn)
                            .map(|slot| slot.wait_start.elapsed())
                            .unwrap_or_default();
                        table.interrupt(txn, WaitStatus::Cancelled);
                        table.waits.remove(&txn);
                        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(txn = %txn, resource = %resource, ?waited, "lock wait timed out");
                        return Err(LockError::Timeout {
                            txn,
                            resource: resource.clone(),
                            mode,
                            waited,
                        });
                    }
                }
            }
        }
    }

    /// Acquires the lock only if it can be granted without waiting (NOWAIT).
    pub fn try_acquire(&self, txn: TxnId, resource: &Resource, mode: LockMode) -> Option<LockGrant> {
        if self.ctx.status().resolve(txn) == Resolution::Aborted {
            return None;
        }
        self.table.lock().try_grant(txn, resource, mode)
    }

    /// Acquires every resource that is immediately available and skips the rest (SKIP LOCKED).
    pub fn acquire_skip_incompatible<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a Resource>,
        mode: LockMode,
        txn: TxnId,
    ) -> Vec<LockGrant> {
        if self.ctx.status().resolve(txn) == Resolution::Aborted {
            return Vec::new();
        }
        let mut table = self.table.lock();
        resources
            .into_iter()
            .filter_map(|resource| table.try_grant(txn, resource, mode))
            .collect()
    }

    /// Releases every lock of `txn` and cancels its pending wait. Safe to call repeatedly.
    pub fn release_all(&self, txn: TxnId) -> usize {
        let mut table = self.table.lock();
        table.interrupt(txn, WaitStatus::Cancelled);
        let released = table.release_grants(txn);
        if released > 0 {
            debug!(txn = %txn, released, "released locks");
        }
        released
    }

    /// Wakes a blocked `acquire` of `txn`, which then fails with [`LockError::Aborted`].
    pub fn cancel_wait(&self, txn: TxnId) -> bool {
        self.table.lock().interrupt(txn, WaitStatus::Cancelled)
    }

    /// Runs one deadlock detection pass and returns the victims it aborted.
    pub fn detect_deadlocks(&self) -> Vec<TxnId> {
        let mut table = self.table.lock();
        self.resolve_deadlocks(&mut table)
    }

    fn resolve_deadlocks(&self, table: &mut LockTable) -> Vec<TxnId> {
        let mut victims = Vec::new();
        while let Some(cycle) = WaitForGraph::build(table).find_cycle() {
            let victim = cycle.victim();
            info!(victim = %victim, cycle = %cycle, "deadlock detected, aborting victim");
            self.ctx.status().abort(victim);
            table.interrupt(victim, WaitStatus::Victim);
            table.release_grants(victim);
            self.counters.deadlock_victims.fetch_add(1, Ordering::Relaxed);
            victims.push(victim);
        }
        victims
    }

    /// Locks currently held by `txn`.
    pub fn held_by(&self, txn: TxnId) -> Vec<(Resource, LockMode)> {
        let table = self.table.lock();
        table
            .held
            .get(&txn)
            .into_iter()
            .flatten()
            .filter_map(|resource| {
                let mode = table.entries.get(resource)?.held_mode(txn)?;
                Some((resource.clone(), mode))
            })
            .collect()
    }

    /// Transactions queued on `resource`, in grant order.
    pub fn waiters(&self, resource: &Resource) -> Vec<TxnId> {
        self.table
            .lock()
            .entries
            .get(resource)
            .map(|entry| entry.queue.iter().map(|w| w.txn).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the current wait-for graph.
    pub fn wait_for_graph(&self) -> WaitForGraph {
        WaitForGraph::build(&self.table.lock())
    }

    pub fn stats(&self) -> LockManagerStats {
        LockManagerStats {
            waits: self.counters.waits.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            deadlock_victims: self.counters.deadlock_victims.load(Ordering::Relaxed),
        }
    }
}
