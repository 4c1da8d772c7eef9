//! Runtimes configured from TOML

use crate::common::*;
use std::time::Duration;
use tranquil::{IsolationLevel, LockMode, Stm, StmConfig, StmError};

const TUNED: &str = r#"
spin_count = 8
max_retries = 2
timeout_ms = 40
isolation_level = "Snapshot"
lock_level = "LockWrites"
speculative = false
"#;

#[test]
fn runtime_defaults_come_from_toml() {
    init_tracing();
    let config = StmConfig::from_toml_str(TUNED).unwrap();
    let stm = Stm::with_config(config).unwrap();

    let builder = stm.transaction_factory_builder();
    let defaults = builder.config();
    assert_eq!(defaults.spin_count, 8);
    assert_eq!(defaults.max_retries, 2);
    assert_eq!(defaults.timeout, Some(Duration::from_millis(40)));
    assert_eq!(defaults.isolation_level, IsolationLevel::Snapshot);
    assert_eq!(defaults.effective_write_lock_mode(), LockMode::Write);
    assert!(!defaults.speculative);
}

#[test]
fn configured_lock_level_is_applied() {
    let stm = Stm::with_config(StmConfig::from_toml_str(TUNED).unwrap()).unwrap();
    let r = stm.new_ref(0u32);

    let mut tx = stm.begin();
    r.set(&mut tx, 1).unwrap();
    assert_eq!(r.atomic_lock_mode(), LockMode::Write);
    tx.commit().unwrap();
    assert_eq!(r.atomic_get().unwrap(), 1);
}

#[test]
fn configured_timeout_bounds_retry() {
    let stm = Stm::with_config(StmConfig::from_toml_str(TUNED).unwrap()).unwrap();
    let r = stm.new_ref(0u32);
    let result: Result<(), _> = stm.atomically(|tx| {
        r.get(tx)?;
        tx.retry()
    });
    assert!(matches!(result, Err(StmError::RetryTimeout(_))));
}

#[test]
fn configured_retry_budget_is_enforced() {
    let stm = Stm::with_config(StmConfig::from_toml_str("max_retries = 2").unwrap()).unwrap();
    let r = stm.new_ref(0u32);
    let result = stm.atomically(|tx| {
        let seen = r.get(tx)?;
        r.atomic_set(seen + 1)?;
        r.set(tx, seen + 100)
    });
    assert!(matches!(result, Err(StmError::TooManyRetries { attempts: 3, .. })));
}

#[test]
fn invalid_documents_are_rejected() {
    assert!(matches!(
        StmConfig::from_toml_str("spin_count = \"fast\""),
        Err(StmError::Config(_))
    ));
    assert!(matches!(
        StmConfig::from_toml_str("spin_count = 0"),
        Err(StmError::IllegalConfiguration(_))
    ));
    assert!(matches!(
        StmConfig::from_toml_str("track_reads = false"),
        Err(StmError::IllegalConfiguration(_))
    ));
}
