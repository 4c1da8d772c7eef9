//! Atomicity and version ordering

use crate::common::*;
use parking_lot::Mutex;
use proptest::prelude::*;
use rand::Rng;
use std::sync::Arc;
use tranquil::{LockMode, StmError, StmResult, TransactionStatus};

// ============================================================================
// Concurrent updates
// ============================================================================

#[test]
fn concurrent_increments_are_never_lost() {
    let stm = new_stm();
    let x = stm.new_ref(0u64);

    let shared = (stm.clone(), x.clone());
    run_concurrently(2, move |_| {
        let (stm, x) = &shared;
        stm.atomically(|tx| {
            let seen = x.get(tx)?;
            x.set(tx, seen + 1)
        })
        .unwrap();
    });

    assert_eq!(x.atomic_get().unwrap(), 2);
}

#[test]
fn many_threads_many_increments() {
    let stm = new_stm();
    let x = stm.new_ref(0u64);

    let shared = (stm.clone(), x.clone());
    run_concurrently(8, move |_| {
        let (stm, x) = &shared;
        for _ in 0..200 {
            stm.atomically(|tx| x.alter(tx, |v| v + 1)).unwrap();
        }
    });

    assert_eq!(x.atomic_get().unwrap(), 1_600);
}

#[test]
fn transfers_preserve_total() {
    const ACCOUNTS: usize = 10;
    let stm = new_stm();
    let accounts: Arc<Vec<_>> = Arc::new((0..ACCOUNTS).map(|_| stm.new_ref(100i64)).collect());

    let shared = (stm.clone(), Arc::clone(&accounts));
    run_concurrently(4, move |_| {
        let (stm, accounts) = &shared;
        let mut rng = rand::thread_rng();
        for _ in 0..250 {
            let from = rng.gen_range(0..ACCOUNTS);
            let to = rng.gen_range(0..ACCOUNTS);
            let amount = rng.gen_range(1..20);
            stm.atomically(|tx| {
                accounts[from].alter(tx, |v| v - amount)?;
                accounts[to].alter(tx, |v| v + amount)
            })
            .unwrap();
        }
    });

    let total = stm
        .atomically(|tx| {
            let mut total = 0;
            for account in accounts.iter() {
                total += account.get(tx)?;
            }
            Ok(total)
        })
        .unwrap();
    assert_eq!(total, 100 * ACCOUNTS as i64);
}

// ============================================================================
// Aborts leave no trace
// ============================================================================

#[test]
fn failed_body_publishes_nothing() {
    let stm = new_stm();
    let a = stm.new_ref(1u32);
    let b = stm.new_ref(2u32);

    let result: StmResult<()> = stm.atomically(|tx| {
        a.set(tx, 10)?;
        b.set(tx, 20)?;
        Err(StmError::user("rolled back"))
    });

    assert!(matches!(result, Err(StmError::User(_))));
    assert_eq!(a.atomic_get().unwrap(), 1);
    assert_eq!(b.atomic_get().unwrap(), 2);
    assert_eq!(a.atomic_version(), 0);
    assert_eq!(stm.version(), 0);
}

#[test]
fn aborted_writes_are_invisible_to_readers() {
    let stm = new_stm();
    let a = stm.new_ref(0u32);
    let b = stm.new_ref(0u32);

    let mut writer = stm.begin();
    a.set(&mut writer, 1).unwrap();
    b.set(&mut writer, 1).unwrap();

    let mut reader = stm.begin();
    assert_eq!(a.get(&mut reader).unwrap(), 0);
    assert_eq!(b.get(&mut reader).unwrap(), 0);
    reader.commit().unwrap();

    writer.abort().unwrap();
    assert_eq!(writer.status(), TransactionStatus::Aborted);
    assert_eq!(a.atomic_get().unwrap(), 0);
    assert_eq!(a.atomic_lock_mode(), LockMode::None);
}

#[test]
fn commute_from_many_threads() {
    let stm = new_stm();
    let counter = stm.new_ref(0u64);

    let shared = (stm.clone(), counter.clone());
    run_concurrently(4, move |_| {
        let (stm, counter) = &shared;
        for _ in 0..100 {
            stm.atomically(|tx| counter.commute(tx, |v| v + 1)).unwrap();
        }
    });

    assert_eq!(counter.atomic_get().unwrap(), 400);
}

#[test]
fn concurrent_commuters_both_commit() {
    let stm = new_stm();
    let counter = stm.new_ref(0u64);

    let mut first = stm.begin();
    let mut second = stm.begin();
    counter.commute(&mut first, |v| v + 1).unwrap();
    counter.commute(&mut second, |v| v + 10).unwrap();

    first.commit().unwrap();
    second.commit().unwrap();
    assert_eq!(counter.atomic_get().unwrap(), 11);
}

#[test]
fn reading_a_commuted_ref_applies_pending_functions() {
    let stm = new_stm();
    let counter = stm.new_ref(5u64);
    let value = stm
        .atomically(|tx| {
            counter.commute(tx, |v| v * 2)?;
            counter.get(tx)
        })
        .unwrap();
    assert_eq!(value, 10);
    assert_eq!(counter.atomic_get().unwrap(), 10);
}

// ============================================================================
// Version monotonicity
// ============================================================================

#[test]
fn observed_versions_strictly_increase() {
    let stm = new_stm();
    let x = stm.new_ref(0u64);
    let observed = Arc::new(Mutex::new(Vec::new()));

    let shared = (stm.clone(), x.clone(), Arc::clone(&observed));
    run_concurrently(4, move |_| {
        let (stm, x, observed) = &shared;
        let mut versions = Vec::with_capacity(50);
        for _ in 0..50 {
            stm.atomically(|tx| x.alter(tx, |v| v + 1)).unwrap();
            versions.push(x.atomic_version());
        }
        observed.lock().push(versions);
    });

    for versions in observed.lock().iter() {
        assert!(
            versions.windows(2).all(|pair| pair[0] < pair[1]),
            "versions went backwards: {:?}",
            versions
        );
    }
    assert_eq!(x.atomic_get().unwrap(), 200);
    assert_eq!(x.atomic_version(), stm.version());
}

proptest! {
    #[test]
    fn committed_versions_follow_the_clock(writes in proptest::collection::vec((0usize..4, 1u32..100), 1..30)) {
        let stm = new_stm();
        let refs: Vec<_> = (0..4).map(|_| stm.new_ref(0u32)).collect();
        let mut last = vec![0u64; refs.len()];

        for (index, delta) in writes {
            stm.atomically(|tx| refs[index].alter(tx, |v| v + delta)).unwrap();
            let version = refs[index].atomic_version();
            prop_assert!(version > last[index]);
            prop_assert_eq!(version, stm.version());
            last[index] = version;
        }
    }
}
