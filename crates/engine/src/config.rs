//! Per-transaction configuration
//!
//! A [`TransactionConfig`] is immutable once a factory is built and shared by
//! every transaction the factory creates. It starts from the engine's
//! [`StmConfig`] and is customised through the
//! [`TransactionFactoryBuilder`](crate::TransactionFactoryBuilder).

use crate::backoff::{BackoffPolicy, ExponentialBackoffPolicy};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tranquil_core::{
    IsolationLevel, LockLevel, LockMode, PropagationLevel, StmConfig, StmError, StmResult,
    TraceLevel,
};

/// Upper bound on the read set scanned without arrivals
///
/// Beyond this size a speculative transaction switches to the rich man's
/// conflict scan.
pub const MAX_POOR_MANS_CONFLICT_SCAN_LENGTH: usize = 20;

/// Family name used when none is configured
pub const DEFAULT_FAMILY_NAME: &str = "anonymous";

/// Immutable settings shared by the transactions of one factory
#[derive(Clone)]
pub struct TransactionConfig {
    /// Diagnostic name of the transaction family
    pub family_name: String,
    /// Reject every write
    pub readonly: bool,
    /// Keep reads attached for validation and blocking retry
    pub track_reads: bool,
    /// Isolation level
    pub isolation_level: IsolationLevel,
    /// Re-runs allowed after the first attempt
    pub max_retries: usize,
    /// Total blocking time allowed across retries
    pub timeout: Option<Duration>,
    /// Whether blocking retry reacts to interruption
    pub interruptible: bool,
    /// Whether retry may block
    pub blocking_allowed: bool,
    /// Pessimistic lock level
    pub lock_level: LockLevel,
    /// Minimum lock taken on every read
    pub read_lock_mode: LockMode,
    /// Minimum lock taken on every write
    pub write_lock_mode: LockMode,
    /// Start small and grow on demand
    pub speculative: bool,
    /// Skip publishing writes equal to the value read
    pub dirty_check: bool,
    /// Behaviour towards an outer transaction
    pub propagation_level: PropagationLevel,
    /// Spin budget for lock acquisition
    pub spin_count: u32,
    /// Capacity of the fixed-length attachment strategy
    pub max_fixed_length_size: usize,
    /// Executor logging detail
    pub trace_level: TraceLevel,
    /// Delay between conflicting attempts
    pub backoff_policy: Arc<dyn BackoffPolicy>,
}

impl fmt::Debug for TransactionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionConfig")
            .field("family_name", &self.family_name)
            .field("readonly", &self.readonly)
            .field("track_reads", &self.track_reads)
            .field("isolation_level", &self.isolation_level)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("lock_level", &self.lock_level)
            .field("speculative", &self.speculative)
            .field("propagation_level", &self.propagation_level)
            .finish_non_exhaustive()
    }
}

impl TransactionConfig {
    /// Derive the defaults from an engine configuration
    pub fn from_stm_config(config: &StmConfig) -> Self {
        TransactionConfig {
            family_name: DEFAULT_FAMILY_NAME.to_string(),
            readonly: false,
            track_reads: config.track_reads,
            isolation_level: config.isolation_level,
            max_retries: config.max_retries,
            timeout: config.timeout_ms.map(Duration::from_millis),
            interruptible: config.interruptible,
            blocking_allowed: config.blocking_allowed,
            lock_level: config.lock_level,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            speculative: config.speculative,
            dirty_check: config.dirty_check,
            propagation_level: PropagationLevel::Requires,
            spin_count: config.spin_count,
            max_fixed_length_size: config.max_fixed_length_size,
            trace_level: config.trace_level,
            backoff_policy: Arc::new(ExponentialBackoffPolicy::default()),
        }
    }

    /// Lock taken when a reference is opened for read
    pub fn effective_read_lock_mode(&self) -> LockMode {
        self.read_lock_mode.max(self.lock_level.read_lock_mode())
    }

    /// Lock taken when a reference is opened for write
    pub fn effective_write_lock_mode(&self) -> LockMode {
        self.write_lock_mode
            .max(self.lock_level.write_lock_mode())
            .max(self.effective_read_lock_mode())
    }

    /// Check the combination of settings
    ///
    /// # Errors
    /// Returns `StmError::IllegalConfiguration` describing the first problem found.
    pub fn validate(&self) -> StmResult<()> {
        if self.readonly && self.write_lock_mode != LockMode::None {
            return Err(StmError::IllegalConfiguration(format!(
                "{}: readonly transaction can't have write lock mode {:?}",
                self.family_name, self.write_lock_mode
            )));
        }
        if self.isolation_level == IsolationLevel::Serializable && !self.track_reads {
            return Err(StmError::IllegalConfiguration(format!(
                "{}: Serializable isolation requires read tracking",
                self.family_name
            )));
        }
        if self.max_fixed_length_size == 0 {
            return Err(StmError::IllegalConfiguration(format!(
                "{}: max_fixed_length_size must be at least 1",
                self.family_name
            )));
        }
        if self.spin_count == 0 {
            return Err(StmError::IllegalConfiguration(format!(
                "{}: spin_count must be at least 1",
                self.family_name
            )));
        }
        Ok(())
    }
}
