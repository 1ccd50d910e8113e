use serde::{Deserialize, Serialize};

use crate::status::{Resolution, TxnStatusTable};
use crate::timestamp::{Timestamp, TxnId};

/// A point-in-time view of committed data, owned by one transaction.
///
/// The snapshot sees every transaction that committed at or before `ts`, plus the owner's own
/// uncommitted writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    owner: TxnId,
    ts: Timestamp,
}

impl Snapshot {
    #[inline]
    pub fn new(owner: TxnId, ts: Timestamp) -> Self {
        Self { owner, ts }
    }

    #[inline]
    pub fn owner(&self) -> TxnId {
        self.owner
    }

    #[inline]
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    /// Returns true if the effects of `writer` are visible to this snapshot.
    pub fn sees(&self, writer: TxnId, status: &TxnStatusTable) -> bool {
        if writer == self.owner {
            return true;
        }
        match status.resolve(writer) {
            Resolution::Committed(commit_ts) => commit_ts <= self.ts,
            Resolution::InProgress | Resolution::Aborted => false,
        }
    }

    /// Returns true if `writer` committed after this snapshot was taken.
    pub fn committed_after(&self, writer: TxnId, status: &TxnStatusTable) -> bool {
        writer != self.owner
            && matches!(status.resolve(writer), Resolution::Committed(ts) if ts > self.ts)
    }
}
