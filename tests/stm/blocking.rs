//! Blocking retry: wakeup, timeout and interruption

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tranquil::StmError;
use tranquil_concurrency::Interrupter;

#[test]
fn retry_wakes_up_after_a_write() {
    let stm = new_stm();
    let mailbox = stm.new_ref(None::<String>);
    let woken = Arc::new(AtomicBool::new(false));

    let consumer = {
        let stm = stm.clone();
        let mailbox = mailbox.clone();
        let woken = Arc::clone(&woken);
        thread::spawn(move || {
            let message = stm
                .atomically(|tx| match mailbox.get(tx)? {
                    Some(message) => {
                        mailbox.set(tx, None)?;
                        Ok(message)
                    }
                    None => tx.retry(),
                })
                .unwrap();
            woken.store(true, Ordering::SeqCst);
            message
        })
    };

    pause();
    assert!(!woken.load(Ordering::SeqCst));
    stm.atomically(|tx| mailbox.set(tx, Some(String::from("hello"))))
        .unwrap();

    assert_eq!(consumer.join().unwrap(), "hello");
    assert_eq!(mailbox.atomic_get().unwrap(), None);
}

#[test]
fn await_value_blocks_until_predicate_holds() {
    let stm = new_stm();
    let level = stm.new_ref(0u32);

    let waiter = {
        let stm = stm.clone();
        let level = level.clone();
        thread::spawn(move || {
            stm.atomically(|tx| {
                level.await_value(tx, |v| *v >= 3)?;
                level.get(tx)
            })
        })
    };

    for _ in 0..3 {
        pause();
        level.atomic_alter(|v| v + 1).unwrap();
    }

    assert_eq!(waiter.join().unwrap().unwrap(), 3);
}

#[test]
fn write_to_an_unread_ref_does_not_wake() {
    let stm = new_stm();
    let watched = stm.new_ref(0u32);
    let unrelated = stm.new_ref(0u32);
    let executor = stm
        .transaction_factory_builder()
        .set_timeout(Some(Duration::from_millis(150)))
        .build_executor()
        .unwrap();

    let waiter = {
        let watched = watched.clone();
        thread::spawn(move || {
            executor.execute(|tx| {
                if watched.get(tx)? == 0 {
                    return tx.retry();
                }
                Ok(())
            })
        })
    };

    pause();
    unrelated.atomic_set(1).unwrap();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(StmError::RetryTimeout(_))));
}

#[test]
fn retry_times_out() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);
    let executor = stm
        .transaction_factory_builder()
        .set_family_name("waits-forever")
        .set_timeout(Some(Duration::from_millis(50)))
        .build_executor()
        .unwrap();

    let started = Instant::now();
    let result: Result<(), _> = executor.execute(|tx| {
        r.get(tx)?;
        tx.retry()
    });

    assert!(matches!(result, Err(StmError::RetryTimeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn interruptible_retry_can_be_cancelled() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);
    let executor = stm
        .transaction_factory_builder()
        .set_interruptible(true)
        .build_executor()
        .unwrap();
    let interrupter = Arc::new(Interrupter::new());

    let waiter = {
        let interrupter = Arc::clone(&interrupter);
        let r = r.clone();
        thread::spawn(move || {
            executor.execute_interruptible(&interrupter, |tx| {
                r.get(tx)?;
                tx.retry::<()>()
            })
        })
    };

    pause();
    interrupter.interrupt();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(StmError::RetryInterrupted(_))));
}

#[test]
fn retry_without_blocking_is_rejected() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);
    let executor = stm
        .transaction_factory_builder()
        .set_blocking_allowed(false)
        .build_executor()
        .unwrap();

    let result: Result<(), _> = executor.execute(|tx| {
        r.get(tx)?;
        tx.retry()
    });
    assert!(matches!(result, Err(StmError::NoBlockingRetryAllowed(_))));
}

#[test]
fn retry_without_reads_is_not_possible() {
    let stm = new_stm();
    let result: Result<(), _> = stm.atomically(|tx| tx.retry());
    assert!(matches!(result, Err(StmError::RetryNotPossible(_))));
}
