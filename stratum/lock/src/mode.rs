use serde::{Deserialize, Serialize};

/// Whether a lock targets a whole table or a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Table,
    Row,
}

/// Lock modes, from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    /// Taken by `SELECT ... FOR SHARE`-style reads
    RowShare,
    /// Taken by writers
    RowExclusive,
    /// Blocks writers, admits other readers
    Share,
    /// Admits nobody else
    Exclusive,
    /// Admits nobody else, including plain readers of the table
    AccessExclusive,
}

impl LockMode {
    /// Check if two lock modes can be held together on a resource of `granularity`.
    pub fn is_compatible_with(&self, other: LockMode, granularity: Granularity) -> bool {
        use LockMode::*;
        match (*self, other) {
            (RowExclusive, RowExclusive) => granularity == Granularity::Table,
            (RowShare, RowShare | RowExclusive | Share)
            | (RowExclusive, RowShare)
            | (Share, RowShare | Share) => true,
            _ => false,
        }
    }

    /// Returns true if holding `self` already grants everything `other` would: every mode that
    /// conflicts with `other` also conflicts with `self`.
    pub fn covers(&self, other: LockMode) -> bool {
        use LockMode::*;
        match (*self, other) {
            (a, b) if a == b => true,
            (AccessExclusive, _) => true,
            (Exclusive, b) => b != AccessExclusive,
            (Share, RowShare) | (RowExclusive, RowShare) => true,
            _ => false,
        }
    }

    /// The weakest mode covering both `self` and `other`, used when a holder upgrades.
    pub fn join(self, other: LockMode) -> LockMode {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            LockMode::Exclusive
        }
    }
}
