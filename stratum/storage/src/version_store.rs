//! Multi-version row storage.
//!
//! Every logical row owns a small arena of physical versions. Versions are linked newest to
//! oldest through `prev` indices into that arena, never through pointers, so unlinking and
//! reclaiming a version is a plain slot operation under the row's mutex.
//!
//! ```text
//!  head
//!   │
//!   ▼
//! [v3 created_by=T9 deleted_by=-] ──prev──> [v2 created_by=T7 deleted_by=T9] ──prev──> [v1 ...]
//! ```
//!
//! Rows themselves live in a lock-free skip map ordered by [`RowKey`], which keeps the rows of
//! a table contiguous for range scans.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use stratum_common::{KeyRange, RowKey};
use stratum_transaction::{EngineContext, Resolution, Snapshot, Timestamp, TxnId};
use tracing::{debug, trace};

use crate::error::{ConflictReason, StorageError, StorageResult};

/// Index of a version inside its row's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionIdx(u32);

impl VersionIdx {
    #[inline]
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Handle to a version created by `put`, recorded in the writer's undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRef {
    pub row_key: RowKey,
    pub idx: VersionIdx,
}

/// One physical version of a logical row.
#[derive(Debug, Clone)]
struct RowVersion {
    /// `None` marks a deletion (tombstone).
    payload: Option<Bytes>,
    created_by: TxnId,
    deleted_by: Option<TxnId>,
    prev: Option<VersionIdx>,
}

/// Version chain of a single row with its own slot arena.
#[derive(Debug, Default)]
struct RowChain {
    slots: Vec<Option<RowVersion>>,
    free: Vec<VersionIdx>,
    head: Option<VersionIdx>,
    /// Set by GC before the row is unlinked from the store; writers must start over.
    retired: bool,
}

impl RowChain {
    fn alloc(&mut self, version: RowVersion) -> VersionIdx {
        if let Some(idx) = self.free.pop() {
            self.slots[idx.0 as usize] = Some(version);
            return idx;
        }
        let idx = VersionIdx(self.slots.len() as u32);
        self.slots.push(Some(version));
        idx
    }

    fn release(&mut self, idx: VersionIdx) -> Option<RowVersion> {
        let version = self.slots.get_mut(idx.0 as usize)?.take();
        if version.is_some() {
            self.free.push(idx);
        }
        version
    }

    fn get(&self, idx: VersionIdx) -> Option<&RowVersion> {
        self.slots.get(idx.0 as usize)?.as_ref()
    }

    fn get_mut(&mut self, idx: VersionIdx) -> Option<&mut RowVersion> {
        self.slots.get_mut(idx.0 as usize)?.as_mut()
    }

    fn head_version(&self) -> Option<&RowVersion> {
        self.head.and_then(|idx| self.get(idx))
    }

    /// Walks the chain from newest to oldest.
    fn iter(&self) -> impl Iterator<Item = (VersionIdx, &RowVersion)> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let version = self.get(idx)?;
            cursor = version.prev;
            Some((idx, version))
        })
    }

    fn live_versions(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Removes the head version and makes its predecessor current again.
    fn unlink_head(&mut self) -> Option<RowVersion> {
        let idx = self.head?;
        let removed = self.release(idx)?;
        self.head = removed.prev;
        if let Some(prev) = removed.prev.and_then(|p| self.get_mut(p)) {
            if prev.deleted_by == Some(removed.created_by) {
                prev.deleted_by = None;
            }
        }
        Some(removed)
    }

    /// The newest version visible to `snapshot`, if any.
    fn visible(&self, snapshot: &Snapshot, ctx: &EngineContext) -> Option<&RowVersion> {
        let status = ctx.status();
        self.iter()
            .map(|(_, version)| version)
            .find(|version| {
                snapshot.sees(version.created_by, status)
                    && !version
                        .deleted_by
                        .is_some_and(|deleter| snapshot.sees(deleter, status))
            })
    }
}

type SharedChain = Arc<Mutex<RowChain>>;

/// Conflict rules a writer is subject to.
#[derive(Debug, Clone, Copy)]
pub struct WriteCheck {
    pub snapshot: Snapshot,
    /// Reject overwriting a version committed after `snapshot` (first-committer-wins).
    pub first_committer_wins: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub versions_freed: usize,
    pub rows_removed: usize,
}

pub struct VersionStore {
    ctx: Arc<EngineContext>,
    rows: SkipMap<RowKey, SharedChain>,
}

impl VersionStore {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            rows: SkipMap::new(),
        }
    }

    /// Returns the chain of `row_key` locked for writing, creating the row if needed.
    fn lock_for_write<R>(&self, row_key: &RowKey, f: impl FnOnce(&mut RowChain) -> R) -> R {
        loop {
            let entry = self
                .rows
                .get_or_insert_with(row_key.clone(), || Arc::new(Mutex::new(RowChain::default())));
            let chain = entry.value().clone();
            let mut guard = chain.lock();
            if guard.retired {
                // GC is unlinking this row; drop the stale entry and retry on a fresh one.
                entry.remove();
                continue;
            }
            return f(&mut *guard);
        }
    }

    /// Appends a new version of `row_key` written by the owner of `check.snapshot`.
    ///
    /// `payload == None` writes a tombstone. The previous current version, if any, gets its
    /// `deleted_by` stamped with the writer. Versions left behind by aborted writers that have
    /// not been undone yet are unlinked first.
    pub fn put(
        &self,
        row_key: &RowKey,
        payload: Option<Bytes>,
        check: WriteCheck,
    ) -> StorageResult<VersionRef> {
        let writer = check.snapshot.owner();
        let status = self.ctx.status();
        self.lock_for_write(row_key, |chain| {
            while let Some(head_writer) = chain.head_version().map(|v| v.created_by) {
                if head_writer == writer {
                    break;
                }
                match status.resolve(head_writer) {
                    Resolution::InProgress => {
                        return Err(StorageError::WriteConflict {
                            row: row_key.clone(),
                            writer,
                            reason: ConflictReason::Uncommitted(head_writer),
                        });
                    }
                    Resolution::Aborted => {
                        chain.unlink_head();
                        trace!(row = %row_key, aborted = %head_writer, "unlinked version of aborted writer");
                    }
                    Resolution::Committed(commit_ts) => {
                        if check.first_committer_wins && commit_ts > check.snapshot.ts() {
                            return Err(StorageError::WriteConflict {
                                row: row_key.clone(),
                                writer,
                                reason: ConflictReason::CommittedAfterSnapshot {
                                    writer: head_writer,
                                    commit_ts,
                                },
                            });
                        }
                        break;
                    }
                }
            }

            let prev = chain.head;
            if let Some(current) = prev.and_then(|idx| chain.get_mut(idx)) {
                current.deleted_by = Some(writer);
            }
            let idx = chain.alloc(RowVersion {
                payload,
                created_by: writer,
                deleted_by: None,
                prev,
            });
            chain.head = Some(idx);
            Ok(VersionRef {
                row_key: row_key.clone(),
                idx,
            })
        })
    }

    /// Returns the payload of `row_key` visible to `snapshot`, or `None` if the row is absent
    /// or deleted in that snapshot.
    pub fn get(&self, row_key: &RowKey, snapshot: &Snapshot) -> Option<Bytes> {
        let chain = self.rows.get(row_key)?.value().clone();
        let chain = chain.lock();
        chain.visible(snapshot, &self.ctx)?.payload.clone()
    }

    /// Returns every row of `range` visible to `snapshot`, in key order.
    pub fn scan(&self, range: &KeyRange, snapshot: &Snapshot) -> Vec<(RowKey, Bytes)> {
        self.rows
            .range(range.row_bounds())
            .filter_map(|entry| {
                let chain = entry.value().lock();
                let payload = chain.visible(snapshot, &self.ctx)?.payload.clone()?;
                Some((entry.key().clone(), payload))
            })
            .collect()
    }

    /// Removes a version created by `writer`, restoring its predecessor as current.
    ///
    /// Undo must run newest-first. Returns false if the version is no longer the head written
    /// by `writer` (another writer already unlinked it after `writer` aborted).
    pub fn undo(&self, version: &VersionRef, writer: TxnId) -> bool {
        let Some(entry) = self.rows.get(&version.row_key) else {
            return false;
        };
        let chain = entry.value().clone();
        let mut chain = chain.lock();
        let is_own_head = chain.head == Some(version.idx)
            && chain
                .head_version()
                .is_some_and(|head| head.created_by == writer);
        if is_own_head {
            chain.unlink_head();
        }
        is_own_head
    }

    /// Frees versions that no snapshot at or after `boundary` can observe.
    ///
    /// A non-head version whose deleter committed strictly before `boundary` is invisible to
    /// every such snapshot, and so is everything older than it. Rows reduced to a tombstone
    /// committed before `boundary`, or to nothing, are removed from the store.
    pub fn prune(&self, boundary: Timestamp) -> PruneStats {
        let status = self.ctx.status();
        let expired = |txn: Option<TxnId>| {
            txn.is_some_and(|txn| {
                matches!(status.resolve(txn), Resolution::Committed(ts) if ts < boundary)
            })
        };

        let mut stats = PruneStats::default();
        for entry in self.rows.iter() {
            let chain = entry.value().clone();
            let mut chain = chain.lock();

            let mut newer = chain.head;
            let mut cursor = chain.head_version().and_then(|v| v.prev);
            while let Some(idx) = cursor {
                let Some((deleted_by, prev)) = chain.get(idx).map(|v| (v.deleted_by, v.prev)) else {
                    break;
                };
                if expired(deleted_by) {
                    if let Some(newer) = newer.and_then(|n| chain.get_mut(n)) {
                        newer.prev = None;
                    }
                    let mut doomed = Some(idx);
                    while let Some(idx) = doomed {
                        doomed = chain.release(idx).and_then(|v| v.prev);
                        stats.versions_freed += 1;
                    }
                    break;
                }
                newer = Some(idx);
                cursor = prev;
            }

            let removable = match chain.head_version() {
                None => true,
                Some(head) => {
                    head.prev.is_none() && head.payload.is_none() && expired(Some(head.created_by))
                }
            };
            if removable {
                if chain.head.is_some() {
                    chain.unlink_head();
                    stats.versions_freed += 1;
                }
                chain.retired = true;
                drop(chain);
                entry.remove();
                stats.rows_removed += 1;
            }
        }
        if stats != PruneStats::default() {
            debug!(
                %boundary,
                versions_freed = stats.versions_freed,
                rows_removed = stats.rows_removed,
                "pruned version chains"
            );
        }
        stats
    }

    /// Number of rows currently tracked, including rows whose only version is a tombstone.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of physical versions of `row_key`.
    pub fn chain_len(&self, row_key: &RowKey) -> usize {
        self.rows
            .get(row_key)
            .map(|entry| entry.value().lock().live_versions())
            .unwrap_or(0)
    }

    /// Total number of physical versions across all rows.
    pub fn version_count(&self) -> usize {
        self.rows
            .iter()
            .map(|entry| entry.value().lock().live_versions())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Bound;

    use super::*;

    fn setup() -> (Arc<EngineContext>, VersionStore) {
        let ctx = Arc::new(EngineContext::default());
        let store = VersionStore::new(ctx.clone());
        (ctx, store)
    }

    fn begin(ctx: &EngineContext) -> Snapshot {
        let txn = ctx.begin_txn().unwrap();
        ctx.capture_snapshot(txn, |s| s)
    }

    fn commit(ctx: &EngineContext, txn: TxnId) -> Timestamp {
        let ts = ctx.next_commit_ts().unwrap();
        ctx.status().commit(txn, ts).unwrap();
        ctx.publish_commit(ts);
        ts
    }

    fn check(snapshot: Snapshot) -> WriteCheck {
        WriteCheck {
            snapshot,
            first_committer_wins: true,
        }
    }

    fn key(k: &'static str) -> RowKey {
        RowKey::new(1, k)
    }

    #[test]
    fn test_put_get_visibility() {
        let (ctx, store) = setup();
        let writer = begin(&ctx);
        let early_reader = begin(&ctx);
        store
            .put(&key("k1"), Some(Bytes::from("v0")), check(writer))
            .unwrap();

        // Own writes are visible, others' uncommitted writes are not.
        assert_eq!(store.get(&key("k1"), &writer), Some(Bytes::from("v0")));
        assert_eq!(store.get(&key("k1"), &early_reader), None);

        commit(&ctx, writer.owner());
        // Committed after the reader's snapshot: still invisible.
        assert_eq!(store.get(&key("k1"), &early_reader), None);

        let late_reader = begin(&ctx);
        assert_eq!(store.get(&key("k1"), &late_reader), Some(Bytes::from("v0")));
    }

    #[test]
    fn test_single_current_version() {
        let (ctx, store) = setup();
        for value in ["a", "b", "c"] {
            let txn = begin(&ctx);
            store
                .put(&key("k"), Some(Bytes::from(value)), check(txn))
                .unwrap();
            commit(&ctx, txn.owner());
        }
        let chain = store.rows.get(&key("k")).unwrap().value().clone();
        let chain = chain.lock();
        let current: Vec<_> = chain.iter().filter(|(_, v)| v.deleted_by.is_none()).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(chain.iter().count(), 3);
    }

    #[test]
    fn test_no_dirty_writes() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        let t2 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("t1")), check(t1)).unwrap();
        let err = store
            .put(&key("k"), Some(Bytes::from("t2")), WriteCheck {
                snapshot: t2,
                first_committer_wins: false,
            })
            .unwrap_err();
        assert_eq!(err, StorageError::WriteConflict {
            row: key("k"),
            writer: t2.owner(),
            reason: ConflictReason::Uncommitted(t1.owner()),
        });
    }

    #[test]
    fn test_first_committer_wins() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        let t2 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("t1")), check(t1)).unwrap();
        commit(&ctx, t1.owner());

        let err = store
            .put(&key("k"), Some(Bytes::from("t2")), check(t2))
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteConflict {
            reason: ConflictReason::CommittedAfterSnapshot { .. },
            ..
        }));

        // Without first-committer-wins (read committed) the overwrite is allowed.
        store
            .put(&key("k"), Some(Bytes::from("t2")), WriteCheck {
                snapshot: t2,
                first_committer_wins: false,
            })
            .unwrap();
    }

    #[test]
    fn test_delete_and_tombstone() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("v")), check(t1)).unwrap();
        commit(&ctx, t1.owner());

        let t2 = begin(&ctx);
        let before_delete = begin(&ctx);
        store.put(&key("k"), None, check(t2)).unwrap();
        assert_eq!(store.get(&key("k"), &t2), None);
        commit(&ctx, t2.owner());

        assert_eq!(store.get(&key("k"), &before_delete), Some(Bytes::from("v")));
        assert_eq!(store.get(&key("k"), &begin(&ctx)), None);
    }

    #[test]
    fn test_undo_restores_previous() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("v1")), check(t1)).unwrap();
        commit(&ctx, t1.owner());

        let t2 = begin(&ctx);
        let w1 = store.put(&key("k"), Some(Bytes::from("w1")), check(t2)).unwrap();
        let w2 = store.put(&key("k"), Some(Bytes::from("w2")), check(t2)).unwrap();
        assert_eq!(store.get(&key("k"), &t2), Some(Bytes::from("w2")));

        assert!(store.undo(&w2, t2.owner()));
        assert_eq!(store.get(&key("k"), &t2), Some(Bytes::from("w1")));
        assert!(store.undo(&w1, t2.owner()));
        assert_eq!(store.get(&key("k"), &t2), Some(Bytes::from("v1")));
        // Undoing twice is a no-op.
        assert!(!store.undo(&w1, t2.owner()));
        assert_eq!(store.chain_len(&key("k")), 1);
    }

    #[test]
    fn test_aborted_head_is_unlinked_by_next_writer() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("v1")), check(t1)).unwrap();
        commit(&ctx, t1.owner());

        let victim = begin(&ctx);
        let stale = store
            .put(&key("k"), Some(Bytes::from("dirty")), check(victim))
            .unwrap();
        ctx.status().abort(victim.owner());

        let t3 = begin(&ctx);
        assert_eq!(store.get(&key("k"), &t3), Some(Bytes::from("v1")));
        store.put(&key("k"), Some(Bytes::from("v3")), check(t3)).unwrap();
        assert_eq!(store.chain_len(&key("k")), 2);

        // The victim's late undo must not touch the new head.
        assert!(!store.undo(&stale, victim.owner()));
        assert_eq!(store.get(&key("k"), &t3), Some(Bytes::from("v3")));
    }

    #[test]
    fn test_scan_in_key_order() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        for k in ["c", "a", "b", "d"] {
            store.put(&key(k), Some(Bytes::from(k)), check(t1)).unwrap();
        }
        store
            .put(&RowKey::new(2, "a"), Some(Bytes::from("other")), check(t1))
            .unwrap();
        store.put(&key("d"), None, check(t1)).unwrap();
        commit(&ctx, t1.owner());

        let reader = begin(&ctx);
        let rows = store.scan(&KeyRange::table(1), &reader);
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![key("a"), key("b"), key("c")]);

        let bounded = KeyRange::new(
            1,
            Bound::Excluded(Bytes::from("a")),
            Bound::Included(Bytes::from("c")),
        );
        assert_eq!(store.scan(&bounded, &reader).len(), 2);
    }

    #[test]
    fn test_prune_keeps_versions_visible_to_boundary() {
        let (ctx, store) = setup();
        let mut commits = Vec::new();
        for value in ["v1", "v2", "v3"] {
            let txn = begin(&ctx);
            store
                .put(&key("k"), Some(Bytes::from(value)), check(txn))
                .unwrap();
            commits.push(commit(&ctx, txn.owner()));
        }
        assert_eq!(store.chain_len(&key("k")), 3);

        // A snapshot at the first commit still needs v1 (deleted by the second commit).
        let stats = store.prune(commits[0]);
        assert_eq!(stats.versions_freed, 0);

        // v1 was deleted before the third commit; v2's deleter is the third commit itself.
        let stats = store.prune(commits[2]);
        assert_eq!(stats.versions_freed, 1);
        assert_eq!(store.chain_len(&key("k")), 2);

        let stats = store.prune(Timestamp::with_ts(commits[2].raw() + 1));
        assert_eq!(stats.versions_freed, 1);
        assert_eq!(store.chain_len(&key("k")), 1);
        assert_eq!(store.get(&key("k"), &begin(&ctx)), Some(Bytes::from("v3")));
    }

    #[test]
    fn test_prune_removes_dead_rows() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("v")), check(t1)).unwrap();
        commit(&ctx, t1.owner());
        let t2 = begin(&ctx);
        store.put(&key("k"), None, check(t2)).unwrap();
        let ts = commit(&ctx, t2.owner());

        let stats = store.prune(Timestamp::with_ts(ts.raw() + 1));
        assert_eq!(stats.rows_removed, 1);
        assert_eq!(store.row_count(), 0);

        // The row can be written again after removal.
        let t3 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("again")), check(t3)).unwrap();
        assert_eq!(store.get(&key("k"), &t3), Some(Bytes::from("again")));
    }

    #[test]
    fn test_put_moves_off_retired_row() {
        let (ctx, store) = setup();
        let t1 = begin(&ctx);
        store.put(&key("k"), None, check(t1)).unwrap();
        commit(&ctx, t1.owner());

        // Marked retired but not yet unlinked from the map, as in the middle of a prune.
        let stale = store.rows.get(&key("k")).unwrap().value().clone();
        stale.lock().retired = true;

        let t2 = begin(&ctx);
        store.put(&key("k"), Some(Bytes::from("fresh")), check(t2)).unwrap();
        let current = store.rows.get(&key("k")).unwrap().value().clone();
        assert!(!Arc::ptr_eq(&stale, &current));
        assert_eq!(store.row_count(), 1);
        assert_eq!(store.chain_len(&key("k")), 1);
        commit(&ctx, t2.owner());
        assert_eq!(store.get(&key("k"), &begin(&ctx)), Some(Bytes::from("fresh")));
    }

    #[test]
    fn test_concurrent_prune_and_put_on_dead_row() {
        let (ctx, store) = setup();
        for round in 0..200 {
            let t1 = begin(&ctx);
            store.put(&key("k"), Some(Bytes::from("v")), check(t1)).unwrap();
            commit(&ctx, t1.owner());
            let t2 = begin(&ctx);
            store.put(&key("k"), None, check(t2)).unwrap();
            let dead_at = commit(&ctx, t2.owner());

            let writer = begin(&ctx);
            let value = Bytes::from(format!("again-{round}"));
            std::thread::scope(|scope| {
                scope.spawn(|| store.prune(Timestamp::with_ts(dead_at.raw() + 1)));
                store.put(&key("k"), Some(value.clone()), check(writer)).unwrap();
            });
            commit(&ctx, writer.owner());

            assert_eq!(store.get(&key("k"), &begin(&ctx)), Some(value));
            assert_eq!(store.row_count(), 1);
        }
    }
}
