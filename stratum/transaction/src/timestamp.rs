//! Transaction identifiers and commit timestamps.
//!
//! Both counters are strictly increasing for the lifetime of an engine. They are owned by the
//! [`EngineContext`](crate::EngineContext) rather than living in process-wide statics, so two
//! engines in one process never share a sequence.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// Unique identifier of a transaction. Later transactions always get larger ids, so the id
/// doubles as the transaction's age.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxnId(u64);

impl TxnId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// A commit timestamp: the position of a commit in the engine's total commit order.
///
/// Snapshots are expressed in the same domain: a snapshot at `ts` sees exactly the
/// transactions whose commit timestamp is `<= ts`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Precedes every real commit. Versions whose creator has been forgotten are treated as
    /// committed at this point.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create timestamp by a given commit ts
    #[inline]
    pub fn with_ts(timestamp: u64) -> Self {
        Self(timestamp)
    }

    /// Returns the maximum possible commit timestamp.
    #[inline]
    pub fn max_commit_ts() -> Self {
        Self(u64::MAX)
    }

    /// Returns the raw value of the timestamp.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts@{}", self.0)
    }
}

/// Advances `counter` by one and returns the previous value, failing instead of wrapping.
fn fetch_next(counter: &AtomicU64, limit: u64) -> Option<u64> {
    let mut cur = counter.load(Ordering::SeqCst);
    loop {
        if cur >= limit {
            return None;
        }
        match counter.compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return Some(cur),
            Err(actual) => cur = actual,
        }
    }
}

/// Generator of commit timestamps
pub struct CommitTsGenerator {
    counter: AtomicU64,
}

impl CommitTsGenerator {
    /// Create a new timestamp generator
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Generate the next timestamp
    pub fn next(&self) -> Result<Timestamp, TimestampError> {
        fetch_next(&self.counter, Timestamp::max_commit_ts().raw())
            .map(Timestamp::with_ts)
            .ok_or_else(|| TimestampError::CommitTsOverflow(self.counter.load(Ordering::SeqCst)))
    }
}

impl Default for CommitTsGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Transaction ID generator
pub struct TransactionIdGenerator {
    counter: AtomicU64,
}

impl TransactionIdGenerator {
    /// Create a new transaction ID generator
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Generate the next transaction ID
    pub fn next(&self) -> Result<TxnId, TimestampError> {
        fetch_next(&self.counter, u64::MAX)
            .map(TxnId::new)
            .ok_or(TimestampError::TxnIdOverflow(u64::MAX))
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
