//! Shared fixtures for the end-to-end tests: a retry loop for transactions and a small bank.

use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use stratum::{
    Engine, EngineConfig, Error, IsolationLevel, LockMode, Resource, Result, RowKey, TableId,
    TxnHandle, WaitPolicy,
};
use tracing::debug;

pub const ACCOUNTS: TableId = 1;

/// An engine without background garbage collection, so tests decide when to sweep.
pub fn quiet_engine() -> Arc<Engine> {
    Arc::new(Engine::new(EngineConfig::default().without_background_gc()))
}

pub fn row(table: TableId, key: &str) -> RowKey {
    RowKey::new(table, key.to_string())
}

pub fn text(value: &str) -> Bytes {
    Bytes::copy_from_slice(value.as_bytes())
}

pub fn encode_u64(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decodes a value written by [`encode_u64`]. Anything else reads as zero.
pub fn decode_u64(payload: Option<Bytes>) -> u64 {
    payload
        .and_then(|payload| <[u8; 8]>::try_from(payload.as_ref()).ok())
        .map_or(0, u64::from_be_bytes)
}

/// Result of [`retry`]: the body's value and how many attempts failed before it succeeded.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub failed_attempts: Vec<&'static str>,
}

/// Runs `body` until it succeeds, retrying errors that are retryable. Gives up after
/// `max_attempts` attempts or on the first non-retryable error.
pub fn retry<T>(max_attempts: usize, mut body: impl FnMut() -> Result<T>) -> Result<Retried<T>> {
    let mut failed_attempts = Vec::new();
    loop {
        match body() {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    failed_attempts,
                });
            }
            Err(err) if err.is_retryable() && failed_attempts.len() + 1 < max_attempts => {
                debug!(%err, attempt = failed_attempts.len() + 1, "retrying transaction");
                failed_attempts.push(err.sqlstate());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Accounts in table [`ACCOUNTS`], all opened with the same balance.
pub struct Bank {
    engine: Arc<Engine>,
    accounts: usize,
    initial: u64,
}

impl Bank {
    pub fn open(engine: Arc<Engine>, accounts: usize, initial: u64) -> Result<Self> {
        let txn = engine.begin(IsolationLevel::ReadCommitted)?;
        for i in 0..accounts {
            engine.write(&txn, Self::account(i), encode_u64(initial))?;
        }
        engine.commit(txn)?;
        Ok(Self {
            engine,
            accounts,
            initial,
        })
    }

    pub fn account(i: usize) -> RowKey {
        RowKey::new(ACCOUNTS, format!("acct-{i:05}"))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn accounts(&self) -> usize {
        self.accounts
    }

    pub fn expected_total(&self) -> u64 {
        self.initial * self.accounts as u64
    }

    pub fn balance(&self, txn: &TxnHandle, i: usize) -> Result<u64> {
        Ok(decode_u64(self.engine.read(txn, &Self::account(i))?))
    }

    /// Moves `amount` between two accounts in one transaction. With `for_update` both rows are
    /// locked exclusively first, in the given order. Returns false if `from` cannot cover it.
    pub fn transfer(
        &self,
        level: IsolationLevel,
        from: usize,
        to: usize,
        amount: u64,
        for_update: bool,
    ) -> Result<bool> {
        let engine = &self.engine;
        let txn = engine.begin(level)?;
        if for_update {
            for i in [from, to] {
                let resource = Resource::Row(Self::account(i));
                engine.lock(&txn, resource, LockMode::Exclusive, WaitPolicy::Block)?;
            }
        }
        let from_balance = self.balance(&txn, from)?;
        if from_balance < amount {
            engine.rollback(&txn);
            return Ok(false);
        }
        let to_balance = self.balance(&txn, to)?;
        engine.write(&txn, Self::account(from), encode_u64(from_balance - amount))?;
        engine.write(&txn, Self::account(to), encode_u64(to_balance + amount))?;
        engine.commit(txn)?;
        Ok(true)
    }

    /// A random transfer between two distinct accounts.
    pub fn random_transfer(
        &self,
        rng: &mut impl Rng,
        level: IsolationLevel,
        for_update: bool,
    ) -> Result<bool> {
        let from = rng.random_range(0..self.accounts);
        let to = (from + rng.random_range(1..self.accounts)) % self.accounts;
        let amount = rng.random_range(1..=50);
        self.transfer(level, from, to, amount, for_update)
    }

    /// Sum of all balances as seen by one `level` transaction, which then commits.
    pub fn total(&self, level: IsolationLevel) -> Result<u64> {
        let txn = self.engine.begin(level)?;
        let total = self.sum(&txn)?;
        self.engine.commit(txn)?;
        Ok(total)
    }

    /// Like [`Bank::total`], but rolls back instead of committing. A serializable reader
    /// that overlapped a transfer would otherwise fail validation at commit.
    pub fn snapshot_total(&self, level: IsolationLevel) -> Result<u64> {
        let txn = self.engine.begin(level)?;
        let total = self.sum(&txn);
        self.engine.rollback(&txn);
        total
    }

    fn sum(&self, txn: &TxnHandle) -> Result<u64> {
        Ok(self
            .engine
            .scan(txn, ACCOUNTS, ..)?
            .into_iter()
            .map(|(_, payload)| decode_u64(Some(payload)))
            .sum())
    }
}

/// Asserts `result` failed with the given SQLSTATE.
pub fn assert_sqlstate<T: std::fmt::Debug>(result: Result<T>, sqlstate: &str) -> Error {
    match result {
        Ok(value) => panic!("expected SQLSTATE {sqlstate}, got Ok({value:?})"),
        Err(err) => {
            assert_eq!(err.sqlstate(), sqlstate, "unexpected error: {err}");
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_stops_on_success() {
        let mut calls = 0;
        let retried = retry(5, || {
            calls += 1;
            if calls < 3 {
                Err(Error::DeadlockVictim(stratum::TxnId::new(calls)))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(retried.value, 3);
        assert_eq!(retried.failed_attempts, vec!["40P01", "40P01"]);
    }

    #[test]
    fn test_retry_gives_up() {
        let result: Result<Retried<()>> =
            retry(2, || Err(Error::DeadlockVictim(stratum::TxnId::new(1))));
        assert!(result.is_err());
    }

    #[test]
    fn test_bank_transfer() {
        let bank = Bank::open(quiet_engine(), 3, 100).unwrap();
        assert!(bank.transfer(IsolationLevel::RepeatableRead, 0, 1, 30, true).unwrap());
        assert!(!bank.transfer(IsolationLevel::RepeatableRead, 2, 1, 101, false).unwrap());
        assert_eq!(bank.total(IsolationLevel::RepeatableRead).unwrap(), 300);
        let txn = bank.engine().begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(bank.balance(&txn, 0).unwrap(), 70);
        assert_eq!(bank.balance(&txn, 1).unwrap(), 130);
    }
}
