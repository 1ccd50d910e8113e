//! Reclamation of versions, commit records and status entries no snapshot can observe.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use stratum_storage::VersionStore;
use stratum_transaction::{EngineContext, Timestamp};
use tracing::{debug, info, trace};

use crate::txn_manager::TransactionManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Every snapshot that is or will be active reads at or above this timestamp.
    pub boundary: Timestamp,
    pub versions_freed: usize,
    pub rows_removed: usize,
    pub commit_records_dropped: usize,
    pub statuses_dropped: usize,
}

impl GcStats {
    pub fn reclaimed_anything(&self) -> bool {
        self.versions_freed + self.rows_removed + self.commit_records_dropped + self.statuses_dropped
            > 0
    }
}

pub struct GarbageCollector {
    ctx: Arc<EngineContext>,
    store: Arc<VersionStore>,
    txns: Arc<TransactionManager>,
    /// Boundary of the last sweep. Held for the whole sweep.
    last_boundary: Mutex<Timestamp>,
}

impl GarbageCollector {
    pub fn new(
        ctx: Arc<EngineContext>,
        store: Arc<VersionStore>,
        txns: Arc<TransactionManager>,
    ) -> Self {
        Self {
            ctx,
            store,
            txns,
            last_boundary: Mutex::new(Timestamp::ZERO),
        }
    }

    /// The oldest snapshot any active transaction may still read from.
    pub fn min_active_snapshot(&self) -> Timestamp {
        self.ctx
            .with_snapshots_paused(|| self.txns.update_watermark())
    }

    /// Runs one full collection pass.
    pub fn sweep(&self) -> GcStats {
        let mut last_boundary = self.last_boundary.lock();
        let boundary = self.min_active_snapshot();
        self.sweep_locked(&mut last_boundary, boundary)
    }

    /// Sweeps if enough commit records are pending, no other sweep is running and the
    /// boundary moved since the last sweep. Everything committed after that sweep lies above
    /// the old boundary, so an unchanged boundary has nothing new to reclaim.
    pub fn maybe_sweep(&self) -> Option<GcStats> {
        let threshold = self.ctx.config().gc_trigger_threshold;
        if threshold == 0 || self.txns.pending_commit_records() < threshold {
            return None;
        }
        let mut last_boundary = self.last_boundary.try_lock()?;
        let boundary = self.min_active_snapshot();
        if boundary <= *last_boundary {
            trace!(%boundary, "watermark has not advanced, skipping sweep");
            return None;
        }
        Some(self.sweep_locked(&mut last_boundary, boundary))
    }

    fn sweep_locked(&self, last_boundary: &mut Timestamp, boundary: Timestamp) -> GcStats {
        *last_boundary = boundary;
        let pruned = self.store.prune(boundary);
        let stats = GcStats {
            boundary,
            versions_freed: pruned.versions_freed,
            rows_removed: pruned.rows_removed,
            commit_records_dropped: self.txns.prune_commit_records(boundary),
            statuses_dropped: self.ctx.status().prune_committed(boundary),
        };
        if stats.reclaimed_anything() {
            info!(
                %boundary,
                versions_freed = stats.versions_freed,
                rows_removed = stats.rows_removed,
                commit_records_dropped = stats.commit_records_dropped,
                statuses_dropped = stats.statuses_dropped,
                "garbage collection finished"
            );
        } else {
            debug!(%boundary, "garbage collection found nothing to reclaim");
        }
        stats
    }
}

/// Background thread sweeping every `interval`. Stops when dropped.
pub struct GcWorker {
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl GcWorker {
    pub fn spawn(gc: Arc<GarbageCollector>, interval: Duration) -> io::Result<Self> {
        let (shutdown, rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("stratum-gc".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            gc.sweep();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("garbage collector shutting down");
            })?;
        Ok(Self {
            shutdown: Some(shutdown),
            worker: Some(worker),
        })
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use stratum_common::{EngineConfig, RowKey};
    use stratum_transaction::IsolationLevel;

    use super::*;
    use crate::isolation::{CommitRecord, IsolationController};

    struct Fixture {
        ctx: Arc<EngineContext>,
        store: Arc<VersionStore>,
        txns: Arc<TransactionManager>,
        gc: GarbageCollector,
        isolation: IsolationController,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let ctx = Arc::new(EngineContext::new(config));
        let store = Arc::new(VersionStore::new(ctx.clone()));
        let txns = Arc::new(TransactionManager::new(ctx.clone()));
        Fixture {
            gc: GarbageCollector::new(ctx.clone(), store.clone(), txns.clone()),
            isolation: IsolationController::new(ctx.clone()),
            ctx,
            store,
            txns,
        }
    }

    impl Fixture {
        /// Writes `value` to `key` in a transaction of its own and commits it.
        fn commit_write(&self, key: &RowKey, value: &'static str) -> Timestamp {
            let txn = self.txns.begin(IsolationLevel::RepeatableRead).unwrap();
            let snapshot = self.isolation.statement_snapshot(&txn, None);
            let check = self.isolation.write_check(txn.isolation(), snapshot);
            self.store.put(key, Some(Bytes::from(value)), check).unwrap();
            let ts = self.ctx.next_commit_ts().unwrap();
            self.ctx.status().commit(txn.id(), ts).unwrap();
            self.ctx.publish_commit(ts);
            self.txns.record_commit(CommitRecord {
                txn: txn.id(),
                commit_ts: ts,
                writes: vec![key.clone()],
                reads: None,
            });
            self.txns.finish(txn.id());
            ts
        }
    }

    #[test]
    fn test_sweep_respects_active_snapshot() {
        let f = fixture(EngineConfig::default().without_background_gc());
        let key = RowKey::new(1, "k");
        f.commit_write(&key, "v1");

        let reader = f.txns.begin(IsolationLevel::RepeatableRead).unwrap();
        let snapshot = f.isolation.statement_snapshot(&reader, None);
        f.commit_write(&key, "v2");
        f.commit_write(&key, "v3");

        let stats = f.gc.sweep();
        assert_eq!(stats.boundary, snapshot.ts());
        // The reader pins v1.
        assert_eq!(f.store.get(&key, &snapshot), Some(Bytes::from("v1")));

        f.txns.finish(reader.id());
        let stats = f.gc.sweep();
        assert_eq!(stats.boundary, f.ctx.latest_commit_ts());
        assert!(stats.versions_freed >= 1);
        assert_eq!(f.store.chain_len(&key), 2);
        assert_eq!(stats.commit_records_dropped, 2);
    }

    #[test]
    fn test_maybe_sweep_threshold() {
        let f = fixture(EngineConfig {
            gc_trigger_threshold: 3,
            ..Default::default()
        });
        let key = RowKey::new(1, "k");
        f.commit_write(&key, "v1");
        f.commit_write(&key, "v2");
        assert_eq!(f.gc.maybe_sweep(), None);
        f.commit_write(&key, "v3");
        let stats = f.gc.maybe_sweep().unwrap();
        assert_eq!(stats.commit_records_dropped, 2);
        assert_eq!(f.txns.pending_commit_records(), 1);
    }

    #[test]
    fn test_maybe_sweep_waits_for_watermark() {
        let f = fixture(EngineConfig {
            gc_trigger_threshold: 2,
            ..Default::default()
        });
        let key = RowKey::new(1, "k");
        let pinned_at = f.commit_write(&key, "v1");
        let reader = f.txns.begin(IsolationLevel::RepeatableRead).unwrap();
        f.isolation.statement_snapshot(&reader, None);
        f.commit_write(&key, "v2");
        f.commit_write(&key, "v3");

        let stats = f.gc.maybe_sweep().unwrap();
        assert_eq!(stats.boundary, pinned_at);
        assert!(!stats.reclaimed_anything());

        // Still over the threshold, but the reader holds the boundary where it was.
        f.commit_write(&key, "v4");
        assert!(f.txns.pending_commit_records() >= 2);
        assert_eq!(f.gc.maybe_sweep(), None);

        f.txns.finish(reader.id());
        let stats = f.gc.maybe_sweep().unwrap();
        assert_eq!(stats.boundary, f.ctx.latest_commit_ts());
        assert_eq!(stats.commit_records_dropped, 3);
        assert_eq!(f.txns.pending_commit_records(), 1);
    }

    #[test]
    fn test_worker_stops_on_drop() {
        let f = fixture(EngineConfig::default());
        let gc = Arc::new(f.gc);
        let worker = GcWorker::spawn(gc, Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(worker);
    }
}
