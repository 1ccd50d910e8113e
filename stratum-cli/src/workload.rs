//! A bank-transfer workload: every transaction moves money between two accounts, so the total
//! balance must stay constant whatever the interleaving.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::{Args, ValueEnum};
use miette::{Diagnostic, IntoDiagnostic};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use stratum::{
    Engine, EngineConfig, EngineStats, IsolationLevel, LockMode, Resource, RowKey, TableId,
    TxnHandle, WaitPolicy,
};
use thiserror::Error;
use tracing::{debug, info};

const ACCOUNTS_TABLE: TableId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsolationArg {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl From<IsolationArg> for IsolationLevel {
    fn from(arg: IsolationArg) -> Self {
        match arg {
            IsolationArg::ReadCommitted => IsolationLevel::ReadCommitted,
            IsolationArg::RepeatableRead => IsolationLevel::RepeatableRead,
            IsolationArg::Serializable => IsolationLevel::Serializable,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct WorkloadArgs {
    /// Number of client threads
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Number of accounts
    #[arg(long, default_value_t = 16)]
    pub accounts: usize,

    /// Transfers per thread
    #[arg(long, default_value_t = 1000)]
    pub transfers: usize,

    #[arg(long, value_enum, default_value_t = IsolationArg::RepeatableRead)]
    pub isolation: IsolationArg,

    /// Engine configuration as JSON; omitted fields take their defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides `lock_timeout` from the configuration
    #[arg(long)]
    pub lock_timeout_ms: Option<u64>,

    #[arg(long, default_value_t = 1000)]
    pub initial_balance: u64,

    /// Attempts per transfer before giving up on it
    #[arg(long, default_value_t = 64)]
    pub max_retries: usize,

    /// Seed for the random transfer generator
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum WorkloadError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] stratum::Error),

    #[error("failed to read configuration {path:?}")]
    #[diagnostic(code(stratum::config))]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration")]
    #[diagnostic(code(stratum::config))]
    ParseConfig(#[from] serde_json::Error),

    #[error("{0} does not hold a balance")]
    #[diagnostic(code(stratum::workload))]
    CorruptBalance(RowKey),

    #[error("money was not conserved: expected {expected}, found {found}")]
    #[diagnostic(code(stratum::workload))]
    BalanceMismatch { expected: u64, found: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub isolation: String,
    pub committed: u64,
    /// Transfers rolled back because the source account could not cover them
    pub insufficient_funds: u64,
    /// Transfers abandoned after `max_retries` failed attempts
    pub gave_up: u64,
    /// Failed attempts by SQLSTATE
    pub aborts: BTreeMap<&'static str, u64>,
    pub expected_total: u64,
    pub final_total: u64,
    pub elapsed: Duration,
    pub engine: EngineStats,
}

#[derive(Debug, Default)]
struct ThreadTally {
    committed: u64,
    insufficient_funds: u64,
    gave_up: u64,
    aborts: BTreeMap<&'static str, u64>,
}

impl ThreadTally {
    fn merge(&mut self, other: ThreadTally) {
        self.committed += other.committed;
        self.insufficient_funds += other.insufficient_funds;
        self.gave_up += other.gave_up;
        for (code, count) in other.aborts {
            *self.aborts.entry(code).or_default() += count;
        }
    }
}

enum Transfer {
    Committed,
    InsufficientFunds,
}

fn account(i: usize) -> RowKey {
    RowKey::new(ACCOUNTS_TABLE, format!("acct-{i:05}"))
}

fn encode_balance(balance: u64) -> Bytes {
    Bytes::copy_from_slice(&balance.to_be_bytes())
}

fn decode_balance(row: &RowKey, payload: Option<Bytes>) -> Result<u64, WorkloadError> {
    payload
        .and_then(|payload| <[u8; 8]>::try_from(payload.as_ref()).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| WorkloadError::CorruptBalance(row.clone()))
}

impl WorkloadArgs {
    pub fn run(&self) -> miette::Result<()> {
        let report = self.execute()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
            return Ok(());
        }
        println!("isolation:          {}", report.isolation);
        println!("committed:          {}", report.committed);
        println!("insufficient funds: {}", report.insufficient_funds);
        println!("gave up:            {}", report.gave_up);
        for (code, count) in &report.aborts {
            println!("aborted {code}:      {count}");
        }
        println!(
            "total balance:      {} (expected {})",
            report.final_total, report.expected_total
        );
        println!("elapsed:            {:?}", report.elapsed);
        Ok(())
    }

    fn engine_config(&self) -> Result<EngineConfig, WorkloadError> {
        let mut config = match &self.config {
            Some(path) => {
                let text =
                    std::fs::read_to_string(path).map_err(|source| WorkloadError::ReadConfig {
                        path: path.clone(),
                        source,
                    })?;
                serde_json::from_str(&text)?
            }
            None => EngineConfig::default(),
        };
        if let Some(ms) = self.lock_timeout_ms {
            config = config.with_lock_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }

    /// Runs the workload and verifies the balance invariant.
    pub fn execute(&self) -> Result<WorkloadReport, WorkloadError> {
        let engine = Engine::start(self.engine_config()?)?;
        let level = IsolationLevel::from(self.isolation);
        self.open_accounts(&engine)?;

        let seed = self.seed.unwrap_or_else(rand::random);
        info!(seed, threads = self.threads, ?level, "starting workload");
        let started = Instant::now();
        let tally = thread::scope(|scope| {
            let workers: Vec<_> = (0..self.threads)
                .map(|i| {
                    let engine = &engine;
                    let rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                    scope.spawn(move || self.client(engine, level, rng))
                })
                .collect();
            let mut total = ThreadTally::default();
            for worker in workers {
                match worker.join() {
                    Ok(tally) => total.merge(tally?),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok::<_, WorkloadError>(total)
        })?;
        let elapsed = started.elapsed();

        let expected_total = self.initial_balance * self.accounts as u64;
        let final_total = total_balance(&engine)?;
        engine.gc();
        if final_total != expected_total {
            return Err(WorkloadError::BalanceMismatch {
                expected: expected_total,
                found: final_total,
            });
        }
        Ok(WorkloadReport {
            isolation: format!("{level:?}"),
            committed: tally.committed,
            insufficient_funds: tally.insufficient_funds,
            gave_up: tally.gave_up,
            aborts: tally.aborts,
            expected_total,
            final_total,
            elapsed,
            engine: engine.stats(),
        })
    }

    fn open_accounts(&self, engine: &Engine) -> Result<(), WorkloadError> {
        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        for i in 0..self.accounts {
            engine.write(&txn, account(i), encode_balance(self.initial_balance))?;
        }
        engine.commit(txn)?;
        Ok(())
    }

    fn client(
        &self,
        engine: &Engine,
        level: IsolationLevel,
        mut rng: StdRng,
    ) -> Result<ThreadTally, WorkloadError> {
        let mut tally = ThreadTally::default();
        if self.accounts < 2 {
            return Ok(tally);
        }
        for _ in 0..self.transfers {
            let from = rng.random_range(0..self.accounts);
            let to = (from + rng.random_range(1..self.accounts)) % self.accounts;
            let amount = rng.random_range(1..=100);

            let mut attempts = 0;
            loop {
                match transfer(engine, level, &account(from), &account(to), amount) {
                    Ok(Transfer::Committed) => tally.committed += 1,
                    Ok(Transfer::InsufficientFunds) => tally.insufficient_funds += 1,
                    Err(WorkloadError::Engine(err)) if err.is_retryable() => {
                        *tally.aborts.entry(err.sqlstate()).or_default() += 1;
                        attempts += 1;
                        debug!(attempts, %err, "transfer failed, retrying");
                        if attempts < self.max_retries {
                            continue;
                        }
                        tally.gave_up += 1;
                    }
                    Err(err) => return Err(err),
                }
                break;
            }
        }
        Ok(tally)
    }
}

/// Moves `amount` from `from` to `to`, locking both rows for update in the given order.
fn transfer(
    engine: &Engine,
    level: IsolationLevel,
    from: &RowKey,
    to: &RowKey,
    amount: u64,
) -> Result<Transfer, WorkloadError> {
    let txn = engine.begin(level)?;
    for row in [from, to] {
        engine.lock(&txn, Resource::Row(row.clone()), LockMode::Exclusive, WaitPolicy::Block)?;
    }
    let from_balance = read_balance(engine, &txn, from)?;
    if from_balance < amount {
        engine.rollback(&txn);
        return Ok(Transfer::InsufficientFunds);
    }
    let to_balance = read_balance(engine, &txn, to)?;
    engine.write(&txn, from.clone(), encode_balance(from_balance - amount))?;
    engine.write(&txn, to.clone(), encode_balance(to_balance + amount))?;
    engine.commit(txn)?;
    Ok(Transfer::Committed)
}

fn read_balance(engine: &Engine, txn: &TxnHandle, row: &RowKey) -> Result<u64, WorkloadError> {
    decode_balance(row, engine.read(txn, row)?)
}

fn total_balance(engine: &Engine) -> Result<u64, WorkloadError> {
    let txn = engine.begin(IsolationLevel::RepeatableRead)?;
    let mut total = 0;
    for (row, payload) in engine.scan(&txn, ACCOUNTS_TABLE, ..)? {
        total += decode_balance(&row, Some(payload))?;
    }
    engine.commit(txn)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::Cli;

    fn args(extra: &[&str]) -> WorkloadArgs {
        let base = ["stratum", "workload", "--seed", "7", "--transfers", "200"];
        let Cli::Workload(args) = Cli::try_parse_from(base.iter().chain(extra)).unwrap();
        args
    }

    #[test]
    fn test_defaults() {
        let args = args(&[]);
        assert_eq!(args.threads, 4);
        assert_eq!(args.isolation, IsolationArg::RepeatableRead);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_balance_is_conserved_at_every_level() {
        for level in ["read-committed", "repeatable-read", "serializable"] {
            let report = args(&["--isolation", level, "--accounts", "4"]).execute().unwrap();
            assert_eq!(report.final_total, report.expected_total);
            assert_eq!(report.gave_up, 0);
            assert_eq!(report.committed + report.insufficient_funds, 4 * 200);
        }
    }

    #[test]
    fn test_decode_balance_rejects_garbage() {
        let row = account(0);
        assert_eq!(decode_balance(&row, Some(encode_balance(42))).unwrap(), 42);
        assert!(matches!(
            decode_balance(&row, Some(Bytes::from_static(b"x"))),
            Err(WorkloadError::CorruptBalance(_))
        ));
        assert!(decode_balance(&row, None).is_err());
    }
}
