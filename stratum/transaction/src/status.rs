//! The authoritative record of every transaction's state and commit timestamp.
//!
//! Version visibility is resolved against this table rather than against the transaction
//! objects themselves, which lets the lock layer abort a deadlock victim without holding a
//! reference to it.

use dashmap::DashMap;

use crate::error::StatusError;
use crate::timestamp::{Timestamp, TxnId};
use crate::transaction::TxnState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnStatus {
    pub state: TxnState,
    pub commit_ts: Option<Timestamp>,
}

/// What a reader needs to know about the writer of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Active or preparing: its writes are visible only to itself.
    InProgress,
    Aborted,
    Committed(Timestamp),
}

#[derive(Debug, Default)]
pub struct TxnStatusTable {
    entries: DashMap<TxnId, TxnStatus>,
}

impl TxnStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, txn: TxnId) {
        self.entries.insert(txn, TxnStatus {
            state: TxnState::Active,
            commit_ts: None,
        });
    }

    pub fn get(&self, txn: TxnId) -> Option<TxnStatus> {
        self.entries.get(&txn).map(|e| *e.value())
    }

    pub fn state(&self, txn: TxnId) -> Option<TxnState> {
        self.get(txn).map(|s| s.state)
    }

    /// Resolves the writer of a version. Transactions that are no longer tracked were
    /// committed before every live snapshot, so they resolve as committed at
    /// [`Timestamp::ZERO`].
    pub fn resolve(&self, txn: TxnId) -> Resolution {
        match self.get(txn) {
            None => Resolution::Committed(Timestamp::ZERO),
            Some(TxnStatus {
                state: TxnState::Committed,
                commit_ts,
            }) => Resolution::Committed(commit_ts.unwrap_or(Timestamp::ZERO)),
            Some(TxnStatus {
                state: TxnState::Aborted,
                ..
            }) => Resolution::Aborted,
            Some(_) => Resolution::InProgress,
        }
    }

    fn transition(
        &self,
        txn: TxnId,
        to: TxnState,
        commit_ts: Option<Timestamp>,
    ) -> Result<(), StatusError> {
        let mut entry = self
            .entries
            .get_mut(&txn)
            .ok_or(StatusError::UnknownTransaction(txn))?;
        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(StatusError::InvalidTransition { txn, from, to });
        }
        entry.state = to;
        entry.commit_ts = commit_ts;
        Ok(())
    }

    /// Active -> Preparing.
    pub fn prepare(&self, txn: TxnId) -> Result<(), StatusError> {
        self.transition(txn, TxnState::Preparing, None)
    }

    /// Active | Preparing -> Committed at `commit_ts`.
    pub fn commit(&self, txn: TxnId, commit_ts: Timestamp) -> Result<(), StatusError> {
        self.transition(txn, TxnState::Committed, Some(commit_ts))
    }

    /// Active | Preparing -> Aborted. Returns false when the transaction was already terminal
    /// or unknown, so concurrent aborters agree on exactly one winner.
    pub fn abort(&self, txn: TxnId) -> bool {
        self.transition(txn, TxnState::Aborted, None).is_ok()
    }

    /// Stops tracking `txn`. Only valid once none of its versions can be reached as
    /// uncommitted data.
    pub fn forget(&self, txn: TxnId) {
        self.entries.remove(&txn);
    }

    /// Forgets every transaction committed strictly before `boundary`.
    pub fn prune_committed(&self, boundary: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, status| {
            !(status.state == TxnState::Committed
                && status.commit_ts.is_some_and(|ts| ts < boundary))
        });
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
