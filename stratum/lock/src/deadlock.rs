//! Wait-for graph construction and cycle detection.
//!
//! The graph is never maintained incrementally. Each detection pass rebuilds it from the lock
//! table, so it always reflects the queues and holders at that instant.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stratum_transaction::TxnId;
use tracing::{debug, info};

use crate::manager::{LockManager, LockTable};

/// Directed graph with an edge `waiter -> holder` for every lock wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

/// Transactions forming a wait cycle, in wait order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockCycle {
    txns: Vec<TxnId>,
}

impl DeadlockCycle {
    pub fn txns(&self) -> &[TxnId] {
        &self.txns
    }

    /// The youngest transaction of the cycle, which has done the least work.
    pub fn victim(&self) -> TxnId {
        self.txns.iter().copied().max().unwrap_or_default()
    }
}

impl fmt::Display for DeadlockCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for txn in &self.txns {
            write!(f, "{txn} -> ")?;
        }
        match self.txns.first() {
            Some(first) => write!(f, "{first}"),
            None => Ok(()),
        }
    }
}

struct DfsState {
    visited: HashSet<TxnId>,
    path: Vec<TxnId>,
    on_path: HashSet<TxnId>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn build(table: &LockTable) -> Self {
        let mut graph = Self::new();
        table.for_each_wait_edge(|waiter, holder| graph.add_edge(waiter, holder));
        graph
    }

    pub fn add_edge(&mut self, waiter: TxnId, holder: TxnId) {
        self.edges.entry(waiter).or_default().insert(holder);
    }

    pub fn edges(&self) -> impl Iterator<Item = (TxnId, TxnId)> + '_ {
        self.edges
            .iter()
            .flat_map(|(waiter, holders)| holders.iter().map(|holder| (*waiter, *holder)))
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Finds one cycle with a depth-first search that tracks the current path.
    pub fn find_cycle(&self) -> Option<DeadlockCycle> {
        let mut state = DfsState {
            visited: HashSet::new(),
            path: Vec::new(),
            on_path: HashSet::new(),
        };
        self.edges
            .keys()
            .find_map(|start| {
                if state.visited.contains(start) {
                    None
                } else {
                    self.visit(*start, &mut state)
                }
            })
    }

    fn visit(&self, node: TxnId, state: &mut DfsState) -> Option<DeadlockCycle> {
        state.visited.insert(node);
        state.path.push(node);
        state.on_path.insert(node);

        for next in self.edges.get(&node).into_iter().flatten() {
            if state.on_path.contains(next) {
                let start = state.path.iter().position(|txn| txn == next).unwrap_or(0);
                return Some(DeadlockCycle {
                    txns: state.path[start..].to_vec(),
                });
            }
            if !state.visited.contains(next) {
                if let Some(cycle) = self.visit(*next, state) {
                    return Some(cycle);
                }
            }
        }

        state.path.pop();
        state.on_path.remove(&node);
        None
    }
}

/// Background thread running a detection pass every `interval`.
///
/// The thread exits when the detector is dropped.
pub struct DeadlockDetector {
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl DeadlockDetector {
    pub fn spawn(manager: Arc<LockManager>, interval: Duration) -> io::Result<Self> {
        let (shutdown, rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("stratum-deadlock".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let victims = manager.detect_deadlocks();
                            if !victims.is_empty() {
                                debug!(?victims, "background pass aborted victims");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("deadlock detector shutting down");
            })?;
        Ok(Self {
            shutdown: Some(shutdown),
            worker: Some(worker),
        })
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
