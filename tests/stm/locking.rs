//! Pessimistic locks

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tranquil::{ControlFlow, LockLevel, LockMode, TransactionStatus};

#[test]
fn write_lock_excludes_other_lockers() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);

    let mut owner = stm.begin();
    r.acquire(&mut owner, LockMode::Write).unwrap();
    assert_eq!(r.lock_mode(&owner).unwrap(), LockMode::Write);
    assert_eq!(r.atomic_lock_mode(), LockMode::Write);

    for mode in [LockMode::Read, LockMode::Write, LockMode::Exclusive] {
        let mut other = stm.begin();
        let error = r.acquire(&mut other, mode).unwrap_err();
        assert_eq!(error.control_flow(), Some(ControlFlow::ReadWriteConflict));
        assert_eq!(other.status(), TransactionStatus::Aborted);
    }

    owner.abort().unwrap();
    assert_eq!(r.atomic_lock_mode(), LockMode::None);
}

#[test]
fn read_locks_are_shared() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);

    let mut first = stm.begin();
    let mut second = stm.begin();
    r.acquire(&mut first, LockMode::Read).unwrap();
    r.acquire(&mut second, LockMode::Read).unwrap();
    assert_eq!(r.atomic_lock_mode(), LockMode::Read);

    let mut writer = stm.begin();
    assert!(r.acquire(&mut writer, LockMode::Write).is_err());

    // upgrading needs the other read lock gone
    let error = r.acquire(&mut first, LockMode::Exclusive).unwrap_err();
    assert!(error.is_conflict());

    second.commit().unwrap();
    let mut third = stm.begin();
    r.acquire(&mut third, LockMode::Read).unwrap();
    r.acquire(&mut third, LockMode::Exclusive).unwrap();
    assert_eq!(r.atomic_lock_mode(), LockMode::Exclusive);
    r.set(&mut third, 9).unwrap();
    third.commit().unwrap();

    assert_eq!(r.atomic_get().unwrap(), 9);
    assert_eq!(r.atomic_lock_mode(), LockMode::None);
}

#[test]
fn exclusive_lock_blocks_atomic_reads() {
    let stm = new_stm();
    let r = stm.new_ref(1u32);
    let mut owner = stm.begin();
    r.acquire(&mut owner, LockMode::Exclusive).unwrap();

    assert!(matches!(r.atomic_get(), Err(tranquil::StmError::Locked(_))));
    assert_eq!(r.atomic_weak_get(), 1);

    owner.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);
}

#[test]
fn lock_level_applies_to_every_open() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);
    let factory = stm
        .transaction_factory_builder()
        .set_lock_level(LockLevel::LockReads)
        .build_factory()
        .unwrap();

    let mut tx = factory.new_transaction();
    r.get(&mut tx).unwrap();
    assert_eq!(r.lock_mode(&tx).unwrap(), LockMode::Read);
    tx.commit().unwrap();
    assert_eq!(r.atomic_lock_mode(), LockMode::None);
}

#[test]
fn at_most_one_writer_inside_the_critical_section() {
    let stm = new_stm();
    let r = stm.new_ref(0u64);
    let inside = Arc::new(AtomicUsize::new(0));

    let shared = (stm.clone(), r.clone(), Arc::clone(&inside));
    run_concurrently(4, move |_| {
        let (stm, r, inside) = &shared;
        for _ in 0..50 {
            stm.atomically(|tx| {
                r.acquire(tx, LockMode::Write)?;
                let holders = inside.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(holders, 1, "two transactions hold the write lock");
                inside.fetch_sub(1, Ordering::SeqCst);
                r.alter(tx, |v| v + 1)
            })
            .unwrap();
        }
    });

    assert_eq!(r.atomic_get().unwrap(), 200);
}
