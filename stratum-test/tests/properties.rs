//! Concurrency properties checked under randomized multi-threaded load.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use stratum::{
    Engine, EngineConfig, IsolationLevel, LockMode, LockOutcome, Resource, TxnState, WaitPolicy,
};
use stratum_test::{Bank, assert_sqlstate, decode_u64, encode_u64, quiet_engine, retry, row, text};

const THREADS: usize = 4;
const MAX_ATTEMPTS: usize = 200;

fn wait_for_lock_waits(engine: &Engine, n: u64) {
    while engine.stats().lock_waits < n {
        thread::sleep(Duration::from_millis(1));
    }
}

/// Readers running alongside transfers always see a consistent total.
#[test]
fn test_snapshot_isolation_under_transfers() {
    for level in [IsolationLevel::RepeatableRead, IsolationLevel::Serializable] {
        let bank = Arc::new(Bank::open(quiet_engine(), 8, 100).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let (bank, done) = (bank.clone(), done.clone());
            thread::spawn(move || {
                let mut scans = 0;
                while !done.load(Ordering::Acquire) || scans == 0 {
                    assert_eq!(bank.snapshot_total(level).unwrap(), bank.expected_total());
                    scans += 1;
                }
                scans
            })
        };
        let writers: Vec<_> = (0..THREADS)
            .map(|i| {
                let bank = bank.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(i as u64);
                    for _ in 0..100 {
                        retry(MAX_ATTEMPTS, || bank.random_transfer(&mut rng, level, false))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
        assert_eq!(bank.total(level).unwrap(), bank.expected_total());
    }
}

/// Concurrent read-modify-write increments are never lost.
#[test]
fn test_no_lost_updates() {
    let cases = [
        (IsolationLevel::RepeatableRead, false),
        (IsolationLevel::Serializable, false),
        (IsolationLevel::ReadCommitted, true),
    ];
    for (level, for_update) in cases {
        let engine = quiet_engine();
        let counter = row(2, "counter");
        let barrier = Arc::new(Barrier::new(THREADS));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let (engine, counter, barrier) = (engine.clone(), counter.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        retry(MAX_ATTEMPTS, || {
                            let txn = engine.begin(level)?;
                            if for_update {
                                let resource = Resource::Row(counter.clone());
                                engine.lock(
                                    &txn,
                                    resource,
                                    LockMode::Exclusive,
                                    WaitPolicy::Block,
                                )?;
                            }
                            let value = decode_u64(engine.read(&txn, &counter)?);
                            engine.write(&txn, counter.clone(), encode_u64(value + 1))?;
                            engine.commit(txn)
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        let total = decode_u64(engine.read(&txn, &counter).unwrap());
        assert_eq!(total, THREADS as u64 * 50, "{level:?}");
    }
}

/// Transfers that lock rows in random order deadlock regularly, yet all of them finish.
#[test]
fn test_deadlock_liveness() {
    let engine = Arc::new(Engine::start(EngineConfig::default()).unwrap());
    let bank = Arc::new(Bank::open(engine.clone(), 4, 1_000).unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let (bank, barrier) = (bank.clone(), barrier.clone());
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + i as u64);
                barrier.wait();
                for _ in 0..100 {
                    retry(MAX_ATTEMPTS, || {
                        bank.random_transfer(&mut rng, IsolationLevel::ReadCommitted, true)
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(bank.total(IsolationLevel::RepeatableRead).unwrap(), bank.expected_total());
    let stats = engine.stats();
    assert_eq!(stats.active_transactions, 0);
}

/// Waiters on one row are granted in arrival order.
#[test]
fn test_lock_fifo_fairness() {
    let engine = quiet_engine();
    let target = Resource::Row(row(3, "hot"));
    let holder = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine
        .lock(&holder, target.clone(), LockMode::Exclusive, WaitPolicy::Block)
        .unwrap();

    let granted = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..4u64 {
        let (thread_engine, target, granted) = (engine.clone(), target.clone(), granted.clone());
        waiters.push(thread::spawn(move || {
            let txn = thread_engine.begin(IsolationLevel::ReadCommitted).unwrap();
            thread_engine
                .lock(&txn, target, LockMode::Exclusive, WaitPolicy::Block)
                .unwrap();
            granted.lock().unwrap().push(i);
            thread_engine.commit(txn).unwrap();
        }));
        wait_for_lock_waits(&engine, i + 1);
    }
    engine.commit(holder).unwrap();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(*granted.lock().unwrap(), vec![0, 1, 2, 3]);
}

/// A sweep never frees a version an active snapshot can still read.
#[test]
fn test_gc_safety() {
    let engine = quiet_engine();
    let key = row(4, "k");
    let write = |value: &str| {
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.write(&txn, key.clone(), text(value)).unwrap();
        engine.commit(txn).unwrap();
    };
    write("v0");
    let reader = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(engine.read(&reader, &key).unwrap(), Some(text("v0")));

    for i in 1..=20 {
        write(format!("v{i}").as_str());
        engine.gc();
        assert_eq!(engine.read(&reader, &key).unwrap(), Some(text("v0")));
    }
    let pinned = engine.stats().versions;
    assert!(pinned >= 20);

    engine.commit(reader).unwrap();
    engine.gc();
    assert!(engine.stats().versions <= 2);
    assert_eq!(engine.stats().watermark, engine.stats().latest_commit_ts);

    let latest = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(engine.read(&latest, &key).unwrap(), Some(text("v20")));
}

#[test]
fn test_nowait_and_skip_locked_queue() {
    let engine = quiet_engine();
    let jobs: Vec<_> = (0..6).map(|i| Resource::Row(row(5, &format!("job-{i}")))).collect();

    let first = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    let claimed = engine
        .lock_all(&first, &jobs[..2], LockMode::Exclusive, WaitPolicy::SkipLocked)
        .unwrap();
    assert_eq!(claimed, jobs[..2].to_vec());

    let second = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_sqlstate(
        engine.lock(&second, jobs[0].clone(), LockMode::Exclusive, WaitPolicy::NoWait),
        "55P03",
    );
    assert_eq!(second.state(), TxnState::Active);
    let outcome = engine
        .lock(&second, jobs[1].clone(), LockMode::Exclusive, WaitPolicy::SkipLocked)
        .unwrap();
    assert_eq!(outcome, LockOutcome::Skipped);
    let claimed = engine
        .lock_all(&second, &jobs, LockMode::Exclusive, WaitPolicy::SkipLocked)
        .unwrap();
    assert_eq!(claimed, jobs[2..].to_vec());

    engine.commit(first).unwrap();
    let outcome = engine
        .lock(&second, jobs[0].clone(), LockMode::Exclusive, WaitPolicy::NoWait)
        .unwrap();
    assert_eq!(outcome, LockOutcome::Acquired(LockMode::Exclusive));
}

#[test]
fn test_rollback_from_another_thread_cancels_wait() {
    let engine = quiet_engine();
    let target = Resource::Row(row(6, "r"));
    let holder = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine
        .lock(&holder, target.clone(), LockMode::Exclusive, WaitPolicy::Block)
        .unwrap();

    let waiter_txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    let waiter = {
        let (engine, txn) = (engine.clone(), waiter_txn.clone());
        thread::spawn(move || engine.lock(&txn, target, LockMode::Exclusive, WaitPolicy::Block))
    };
    wait_for_lock_waits(&engine, 1);
    engine.rollback(&waiter_txn);

    assert_sqlstate(waiter.join().unwrap(), "25000");
    assert_eq!(waiter_txn.state(), TxnState::Aborted);
    assert!(engine.locks_held(&waiter_txn).is_empty());
    engine.commit(holder).unwrap();
}

#[test]
fn test_lock_timeout_keeps_transaction_open() {
    let config = EngineConfig::default()
        .with_lock_timeout(Duration::from_millis(30))
        .without_background_gc();
    let engine = Engine::new(config);
    let key = row(7, "r");
    let holder = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine.write(&holder, key.clone(), "held").unwrap();

    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_sqlstate(engine.write(&txn, key.clone(), "blocked"), "55P03");
    assert_eq!(txn.state(), TxnState::Active);
    assert_eq!(engine.read(&txn, &key).unwrap(), None);
    assert_eq!(engine.stats().lock_timeouts, 1);

    engine.commit(holder).unwrap();
    engine.write(&txn, key.clone(), "after").unwrap();
    engine.commit(txn).unwrap();
}
