use std::fmt;
use std::ops::Bound;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Internal identifier associated with a table (engine-wide unique).
pub type TableId = u32;

/// Logical identity of a row: the table it belongs to plus an opaque key.
///
/// Row keys order first by table and then bytewise by key, so all rows of one
/// table are contiguous in any ordered map keyed by `RowKey`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    table: TableId,
    key: Bytes,
}

impl RowKey {
    #[inline]
    pub fn new(table: TableId, key: impl Into<Bytes>) -> Self {
        Self {
            table,
            key: key.into(),
        }
    }

    #[inline]
    pub fn table(&self) -> TableId {
        self.table
    }

    #[inline]
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The smallest possible key of `table`.
    #[inline]
    pub fn table_start(table: TableId) -> Self {
        Self::new(table, Bytes::new())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, String::from_utf8_lossy(&self.key))
    }
}

/// A contiguous range of keys inside one table, as read by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    table: TableId,
    start: Bound<Bytes>,
    end: Bound<Bytes>,
}

impl KeyRange {
    pub fn new(table: TableId, start: Bound<Bytes>, end: Bound<Bytes>) -> Self {
        Self { table, start, end }
    }

    /// Every key of `table`.
    pub fn table(table: TableId) -> Self {
        Self::new(table, Bound::Unbounded, Bound::Unbounded)
    }

    pub fn contains(&self, row: &RowKey) -> bool {
        if row.table != self.table {
            return false;
        }
        let key = &row.key;
        let after_start = match &self.start {
            Bound::Included(start) => key >= start,
            Bound::Excluded(start) => key > start,
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(end) => key <= end,
            Bound::Excluded(end) => key < end,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    /// The same range expressed over [`RowKey`]s, for ordered maps keyed by row.
    pub fn row_bounds(&self) -> (Bound<RowKey>, Bound<RowKey>) {
        let lift = |bound: &Bound<Bytes>| match bound {
            Bound::Included(key) => Bound::Included(RowKey::new(self.table, key.clone())),
            Bound::Excluded(key) => Bound::Excluded(RowKey::new(self.table, key.clone())),
            Bound::Unbounded => Bound::Unbounded,
        };
        let start = match lift(&self.start) {
            Bound::Unbounded => Bound::Included(RowKey::table_start(self.table)),
            bound => bound,
        };
        let end = match lift(&self.end) {
            Bound::Unbounded => match self.table.checked_add(1) {
                Some(next) => Bound::Excluded(RowKey::table_start(next)),
                None => Bound::Unbounded,
            },
            bound => bound,
        };
        (start, end)
    }
}
