//! Isolation levels and the anomalies they admit

use crate::common::*;
use tranquil::{ControlFlow, IsolationLevel, StmError, TransactionStatus};

/// Two transactions each read both refs and write the one the other relies on
fn write_skew(level: IsolationLevel) -> (Result<(), StmError>, Result<(), StmError>) {
    let stm = new_stm();
    let a = stm.new_ref(50i64);
    let b = stm.new_ref(50i64);
    let factory = executor_at(&stm, level).factory().clone();

    let mut first = factory.new_transaction();
    let mut second = factory.new_transaction();

    let total = a.get(&mut first).unwrap() + b.get(&mut first).unwrap();
    assert_eq!(total, 100);
    let total = a.get(&mut second).unwrap() + b.get(&mut second).unwrap();
    assert_eq!(total, 100);

    a.set(&mut first, -40).unwrap();
    b.set(&mut second, -40).unwrap();

    (first.commit(), second.commit())
}

#[test]
fn serializable_prevents_write_skew() {
    let (first, second) = write_skew(IsolationLevel::Serializable);
    assert!(first.is_ok());
    let error = second.unwrap_err();
    assert!(error.is_conflict());
    assert_eq!(error.control_flow(), Some(ControlFlow::ReadWriteConflict));
}

#[test]
fn snapshot_allows_write_skew() {
    let (first, second) = write_skew(IsolationLevel::Snapshot);
    assert!(first.is_ok());
    assert!(second.is_ok());
}

#[test]
fn ensure_prevents_write_skew_under_snapshot() {
    let stm = new_stm();
    let a = stm.new_ref(50i64);
    let b = stm.new_ref(50i64);
    let factory = executor_at(&stm, IsolationLevel::Snapshot).factory().clone();

    let mut first = factory.new_transaction();
    let mut second = factory.new_transaction();
    b.ensure(&mut first).unwrap();
    a.ensure(&mut second).unwrap();
    a.set(&mut first, -40).unwrap();
    b.set(&mut second, -40).unwrap();

    first.commit().unwrap();
    assert!(second.commit().unwrap_err().is_conflict());
    assert_eq!(second.status(), TransactionStatus::Aborted);
    assert_eq!(a.atomic_get().unwrap(), -40);
    assert_eq!(b.atomic_get().unwrap(), 50);
}

#[test]
fn withdrawals_respect_combined_balance() {
    let stm = new_stm();
    let a = stm.new_ref(50i64);
    let b = stm.new_ref(50i64);
    let executor = executor_at(&stm, IsolationLevel::Serializable);

    let withdraw = |from: usize| {
        executor.execute(|tx| {
            if a.get(tx)? + b.get(tx)? < 90 {
                return Ok(false);
            }
            let target = if from == 0 { &a } else { &b };
            target.alter(tx, |v| v - 90)?;
            Ok(true)
        })
    };

    assert!(withdraw(0).unwrap());
    assert!(!withdraw(1).unwrap());
    assert_eq!(a.atomic_get().unwrap() + b.atomic_get().unwrap(), 10);
}

#[test]
fn aba_is_not_detected() {
    let stm = new_stm();
    let x = stm.new_ref(String::from("A"));
    let mut tx = stm.begin();
    let seen = x.get(&mut tx).unwrap();

    x.atomic_set(String::from("B")).unwrap();
    x.atomic_set(String::from("A")).unwrap();
    assert_eq!(x.atomic_version(), 2);

    x.set(&mut tx, seen).unwrap();
    tx.commit().unwrap();
    assert_eq!(x.atomic_get().unwrap(), "A");
    assert_eq!(x.atomic_version(), 2);
}

#[test]
fn inconsistent_snapshot_forces_a_rerun() {
    let stm = new_stm();
    let a = stm.new_ref(0u32);
    let b = stm.new_ref(0u32);
    let executor = executor_at(&stm, IsolationLevel::Snapshot);
    let mut runs = 0;

    let (x, y) = executor
        .execute(|tx| {
            runs += 1;
            let x = a.get(tx)?;
            if runs == 1 {
                a.atomic_set(1)?;
                b.atomic_set(1)?;
            }
            let y = b.get(tx)?;
            Ok((x, y))
        })
        .unwrap();

    assert_eq!(runs, 2);
    assert_eq!((x, y), (1, 1));
}

#[test]
fn read_committed_sees_latest_values() {
    let stm = new_stm();
    let a = stm.new_ref(0u32);
    let b = stm.new_ref(0u32);
    let executor = executor_at(&stm, IsolationLevel::ReadCommitted);
    let mut runs = 0;

    let (x, y) = executor
        .execute(|tx| {
            runs += 1;
            let x = a.get(tx)?;
            if runs == 1 {
                a.atomic_set(1)?;
                b.atomic_set(1)?;
            }
            let y = b.get(tx)?;
            Ok((x, y))
        })
        .unwrap();

    assert_eq!(runs, 1);
    assert_eq!((x, y), (0, 1));
}

#[test]
fn update_of_read_biased_ref_invalidates_untracked_readers() {
    let stm = new_stm();
    let hot = stm.new_ref(0u32);
    let other = stm.new_ref(0u32);
    let factory = executor_at(&stm, IsolationLevel::Serializable).factory().clone();

    let threshold = stm.config().read_biased_threshold as usize;
    for _ in 0..threshold + 72 {
        let mut tx = factory.new_transaction();
        hot.get(&mut tx).unwrap();
        tx.commit().unwrap();
    }
    assert!(hot.is_read_biased());

    let mut reader = factory.new_transaction();
    assert!(reader.is_rich_mans_conflict_scan());
    assert_eq!(hot.get(&mut reader).unwrap(), 0);

    let before = stm.conflict_count();
    let mut writer = factory.new_transaction();
    hot.set(&mut writer, 1).unwrap();
    other.set(&mut writer, 1).unwrap();
    writer.commit().unwrap();
    assert!(stm.conflict_count() > before);

    let error = other.get(&mut reader).unwrap_err();
    assert_eq!(error.control_flow(), Some(ControlFlow::ReadConflict));
    assert_eq!(reader.status(), TransactionStatus::Aborted);
}
