//! Executor retry policy, speculative growth and propagation

use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tranquil::{PropagationLevel, StmError, TraceLevel};
use tranquil_engine::{AttachmentStrategy, ExponentialBackoffPolicy, NoBackoff};

// ============================================================================
// Retry budget
// ============================================================================

#[test]
fn always_conflicting_body_gives_up_after_max_retries() {
    let stm = new_stm();
    let r = stm.new_ref(0u64);
    let executor = stm
        .transaction_factory_builder()
        .set_family_name("hopeless")
        .set_max_retries(5)
        .set_backoff_policy(Arc::new(NoBackoff))
        .build_executor()
        .unwrap();
    let attempts = AtomicUsize::new(0);

    let result = executor.execute(|tx| {
        attempts.fetch_add(1, Ordering::SeqCst);
        let seen = r.get(tx)?;
        r.atomic_set(seen + 1)?;
        r.set(tx, seen + 1_000)
    });

    assert!(matches!(
        result,
        Err(StmError::TooManyRetries { ref family, attempts: 6 }) if family == "hopeless"
    ));
    assert_eq!(attempts.load(Ordering::SeqCst), 6);
    assert_eq!(r.atomic_get().unwrap(), 6);
}

#[test]
fn conflicts_back_off_between_attempts() {
    let stm = new_stm();
    let r = stm.new_ref(0u64);
    let executor = stm
        .transaction_factory_builder()
        .set_backoff_policy(Arc::new(ExponentialBackoffPolicy::new(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_millis(4),
        )))
        .set_trace_level(TraceLevel::Coarse)
        .build_executor()
        .unwrap();
    let mut runs = 0;

    executor
        .execute(|tx| {
            runs += 1;
            let seen = r.get(tx)?;
            if runs < 3 {
                r.atomic_set(seen + 1)?;
            }
            r.set(tx, seen + 10)
        })
        .unwrap();

    assert_eq!(runs, 3);
    assert_eq!(r.atomic_get().unwrap(), 12);
}

#[test]
fn readonly_transaction_cannot_write() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);
    let executor = stm
        .transaction_factory_builder()
        .set_readonly(true)
        .build_executor()
        .unwrap();

    let result = executor.execute(|tx| r.set(tx, 1));
    assert!(matches!(result, Err(StmError::Readonly(_))));
    assert_eq!(r.atomic_get().unwrap(), 0);
    assert_eq!(executor.execute(|tx| r.get(tx)).unwrap(), 0);
}

#[test]
fn abort_only_is_reported_not_retried() {
    let stm = new_stm();
    let r = stm.new_ref(0u32);
    let mut runs = 0;

    let result = stm.atomically(|tx| {
        runs += 1;
        r.set(tx, 1)?;
        tx.set_abort_only()
    });

    assert!(matches!(result, Err(StmError::AbortOnly(_))));
    assert_eq!(runs, 1);
    assert_eq!(r.atomic_get().unwrap(), 0);
}

// ============================================================================
// Speculative growth
// ============================================================================

#[test]
fn factory_grows_through_every_strategy() {
    let stm = new_stm();
    let refs: Vec<_> = (0..30).map(|i| stm.new_ref(i as u64)).collect();
    let executor = stm
        .transaction_factory_builder()
        .set_max_retries(0)
        .build_executor()
        .unwrap();
    let strategy = || executor.factory().speculative_configuration().attachment_strategy();
    assert_eq!(strategy(), AttachmentStrategy::Mono);

    let sum_of = |count: usize| {
        executor.execute(|tx| {
            let mut sum = 0;
            for r in &refs[..count] {
                sum += r.get(tx)?;
            }
            Ok(sum)
        })
    };

    assert_eq!(sum_of(1).unwrap(), 0);
    assert_eq!(strategy(), AttachmentStrategy::Mono);

    assert_eq!(sum_of(5).unwrap(), 10);
    assert_eq!(strategy(), AttachmentStrategy::FixedLength(20));

    assert_eq!(sum_of(30).unwrap(), 435);
    assert_eq!(strategy(), AttachmentStrategy::Variable);
    assert!(executor.factory().speculative_configuration().is_rich_mans_conflict_scan_required());
}

#[test]
fn default_executors_share_upgrades() {
    let stm = new_stm();
    let a = stm.new_ref(1u8);
    let b = stm.new_ref(2u8);
    stm.atomically(|tx| Ok(a.get(tx)? + b.get(tx)?)).unwrap();

    let tx = stm.default_executor().factory().new_transaction();
    assert_eq!(tx.attachment_strategy(), AttachmentStrategy::FixedLength(20));
}

// ============================================================================
// Propagation
// ============================================================================

#[test]
fn nested_requires_joins_outer_work() {
    let stm = new_stm();
    let a = stm.new_ref(0u32);
    let b = stm.new_ref(0u32);
    let inner = stm.default_executor();

    let result: Result<(), _> = stm.atomically(|tx| {
        a.set(tx, 1)?;
        inner.execute_in(Some(tx), |tx| b.set(tx, 1))?;
        Err(StmError::user("outer fails"))
    });

    assert!(result.is_err());
    assert_eq!(a.atomic_get().unwrap(), 0);
    assert_eq!(b.atomic_get().unwrap(), 0);
}

#[test]
fn nested_requires_new_commits_independently() {
    let stm = new_stm();
    let audit = stm.new_ref(0u32);
    let balance = stm.new_ref(0u32);
    let independent = stm
        .transaction_factory_builder()
        .set_propagation_level(PropagationLevel::RequiresNew)
        .build_executor()
        .unwrap();

    let result: Result<(), _> = stm.atomically(|tx| {
        balance.set(tx, 5)?;
        independent.execute_in(Some(tx), |inner| audit.alter(inner, |v| v + 1))?;
        Err(StmError::user("outer fails"))
    });

    assert!(result.is_err());
    assert_eq!(balance.atomic_get().unwrap(), 0);
    assert_eq!(audit.atomic_get().unwrap(), 1);
}

#[test]
fn mandatory_and_never_guard_nesting() {
    let stm = new_stm();
    let mandatory = stm
        .transaction_factory_builder()
        .set_propagation_level(PropagationLevel::Mandatory)
        .build_executor()
        .unwrap();
    let never = stm
        .transaction_factory_builder()
        .set_propagation_level(PropagationLevel::Never)
        .build_executor()
        .unwrap();

    assert!(matches!(mandatory.execute(|_| Ok(())), Err(StmError::TransactionRequired(_))));
    let result = stm.atomically(|tx| never.execute_in(Some(tx), |_| Ok(())));
    assert!(matches!(result, Err(StmError::TransactionNotAllowed(_))));
    assert!(stm.atomically(|tx| mandatory.execute_in(Some(tx), |_| Ok(()))).is_ok());
}
