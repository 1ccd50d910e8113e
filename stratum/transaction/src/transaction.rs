//! Isolation levels and the transaction state machine.

use serde::{Deserialize, Serialize};

/// Isolation level for transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Every statement reads from a fresh snapshot
    ReadCommitted,
    /// One snapshot, taken at the first statement, serves the whole transaction
    RepeatableRead,
    /// Repeatable read plus commit-time read/write conflict validation
    Serializable,
}

impl IsolationLevel {
    /// Whether the snapshot is captured once and then frozen.
    #[inline]
    pub fn freezes_snapshot(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }

    /// Whether overwriting a row committed after the snapshot is a write conflict.
    #[inline]
    pub fn first_committer_wins(&self) -> bool {
        self.freezes_snapshot()
    }

    /// Whether reads are tracked and validated at commit.
    #[inline]
    pub fn validates_reads(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

/// Lifecycle state of a transaction.
///
/// ```text
/// Active ──commit (serializable)──> Preparing ──validated──> Committed
///   │                                   └────rejected──────> Aborted
///   ├──commit──> Committed
///   └──rollback / deadlock victim──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

impl TxnState {
    /// Returns true if the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (*self, to),
            (Active, Preparing)
                | (Active, Committed)
                | (Active, Aborted)
                | (Preparing, Committed)
                | (Preparing, Aborted)
        )
    }
}
