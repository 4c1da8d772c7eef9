//! Transaction factories and speculative configuration
//!
//! A factory hands out transactions sharing one [`TransactionConfig`]. With
//! speculation enabled, transactions start as small as possible (one slot,
//! poor man's conflict scan) and the factory grows them when an attempt proves
//! them too small. The upgrade is shared by every later transaction of the
//! factory and never reverts.

use crate::backoff::BackoffPolicy;
use crate::config::TransactionConfig;
use crate::executor::TransactionExecutor;
use crate::stm::Stm;
use crate::transaction::{AttachmentStrategy, Transaction};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tranquil_core::{
    IsolationLevel, LockLevel, LockMode, PropagationLevel, SpeculativeFailure, StmResult,
    TraceLevel,
};

/// Current sizing decisions of a factory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculativeConfiguration {
    enabled: bool,
    minimal_length: usize,
    rich_mans_conflict_scan: bool,
    max_fixed_length_size: usize,
}

impl SpeculativeConfiguration {
    /// Starting point for `config`
    pub fn new(config: &TransactionConfig) -> Self {
        if !config.speculative {
            return Self::non_speculative(config);
        }
        SpeculativeConfiguration {
            enabled: true,
            minimal_length: 1,
            rich_mans_conflict_scan: false,
            max_fixed_length_size: config.max_fixed_length_size,
        }
    }

    /// Largest strategy from the start
    pub fn non_speculative(config: &TransactionConfig) -> Self {
        SpeculativeConfiguration {
            enabled: false,
            minimal_length: config.max_fixed_length_size + 1,
            rich_mans_conflict_scan: true,
            max_fixed_length_size: config.max_fixed_length_size,
        }
    }

    /// Whether sizing adapts to failures
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Smallest number of references a transaction must hold
    pub fn minimal_length(&self) -> usize {
        self.minimal_length
    }

    /// Whether reads must arrive at their orec
    pub fn is_rich_mans_conflict_scan_required(&self) -> bool {
        self.rich_mans_conflict_scan
    }

    /// Strategy used by new transactions
    pub fn attachment_strategy(&self) -> AttachmentStrategy {
        if !self.enabled || self.minimal_length > self.max_fixed_length_size {
            AttachmentStrategy::Variable
        } else if self.minimal_length <= 1 {
            AttachmentStrategy::Mono
        } else {
            AttachmentStrategy::FixedLength(self.max_fixed_length_size)
        }
    }

    /// Configuration after `failure`
    ///
    /// Never smaller than `self`.
    pub fn upgraded(&self, failure: SpeculativeFailure) -> Self {
        let mut next = *self;
        match failure {
            SpeculativeFailure::TransactionTooSmall { required } => {
                next.minimal_length = next.minimal_length.max(required);
            }
            SpeculativeFailure::RichMansConflictScanRequired => {
                next.rich_mans_conflict_scan = true;
            }
        }
        next
    }
}

/// Builds [`TransactionFactory`] and [`TransactionExecutor`] instances
///
/// Every setter consumes and returns the builder.
///
/// # Example
///
/// ```ignore
/// let executor = stm
///     .transaction_factory_builder()
///     .set_family_name("transfer")
///     .set_max_retries(50)
///     .set_lock_level(LockLevel::LockWrites)
///     .build_executor()?;
/// ```
#[derive(Clone)]
pub struct TransactionFactoryBuilder {
    stm: Stm,
    config: TransactionConfig,
}

impl fmt::Debug for TransactionFactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFactoryBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl TransactionFactoryBuilder {
    pub(crate) fn new(stm: Stm, config: TransactionConfig) -> Self {
        TransactionFactoryBuilder { stm, config }
    }

    /// Configuration built so far
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Name used in diagnostics
    pub fn set_family_name(mut self, family_name: impl Into<String>) -> Self {
        self.config.family_name = family_name.into();
        self
    }

    /// Reject every write
    pub fn set_readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = readonly;
        self
    }

    /// Keep reads attached for validation and blocking retry
    pub fn set_read_tracking_enabled(mut self, enabled: bool) -> Self {
        self.config.track_reads = enabled;
        self
    }

    /// Isolation level
    pub fn set_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.config.isolation_level = level;
        self
    }

    /// Allow write skew (`Snapshot`) or forbid it (`Serializable`)
    ///
    /// `ReadCommitted` already allows write skew and is left alone.
    pub fn set_write_skew_allowed(mut self, allowed: bool) -> Self {
        self.config.isolation_level = match (allowed, self.config.isolation_level) {
            (true, IsolationLevel::Serializable) => IsolationLevel::Snapshot,
            (false, _) => IsolationLevel::Serializable,
            (_, level) => level,
        };
        self
    }

    /// Re-runs allowed after the first attempt
    pub fn set_max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Total blocking time for retries, `None` for no limit
    pub fn set_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Total blocking time for retries in nanoseconds
    pub fn set_timeout_ns(self, timeout_ns: u64) -> Self {
        self.set_timeout(Some(Duration::from_nanos(timeout_ns)))
    }

    /// Whether a blocking retry reacts to interruption
    pub fn set_interruptible(mut self, interruptible: bool) -> Self {
        self.config.interruptible = interruptible;
        self
    }

    /// Whether retry may block
    pub fn set_blocking_allowed(mut self, allowed: bool) -> Self {
        self.config.blocking_allowed = allowed;
        self
    }

    /// Pessimistic lock level
    pub fn set_lock_level(mut self, level: LockLevel) -> Self {
        self.config.lock_level = level;
        self
    }

    /// Minimum lock taken on every read
    pub fn set_read_lock_mode(mut self, mode: LockMode) -> Self {
        self.config.read_lock_mode = mode;
        self
    }

    /// Minimum lock taken on every write
    pub fn set_write_lock_mode(mut self, mode: LockMode) -> Self {
        self.config.write_lock_mode = mode;
        self
    }

    /// Start small and grow on demand
    pub fn set_speculative_configuration_enabled(mut self, enabled: bool) -> Self {
        self.config.speculative = enabled;
        self
    }

    /// Skip publishing writes equal to the value read
    pub fn set_dirty_check_enabled(mut self, enabled: bool) -> Self {
        self.config.dirty_check = enabled;
        self
    }

    /// Behaviour towards an outer transaction
    pub fn set_propagation_level(mut self, level: PropagationLevel) -> Self {
        self.config.propagation_level = level;
        self
    }

    /// Spin budget for lock acquisition
    pub fn set_spin_count(mut self, spin_count: u32) -> Self {
        self.config.spin_count = spin_count;
        self
    }

    /// Capacity of the fixed-length strategy
    pub fn set_max_fixed_length_size(mut self, size: usize) -> Self {
        self.config.max_fixed_length_size = size;
        self
    }

    /// Delay between conflicting attempts
    pub fn set_backoff_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.config.backoff_policy = policy;
        self
    }

    /// Executor logging detail
    pub fn set_trace_level(mut self, level: TraceLevel) -> Self {
        self.config.trace_level = level;
        self
    }

    /// Validate and build a factory
    ///
    /// # Errors
    /// Returns `IllegalConfiguration` for an inconsistent combination.
    pub fn build_factory(self) -> StmResult<TransactionFactory> {
        self.config.validate()?;
        let speculative = SpeculativeConfiguration::new(&self.config);
        Ok(TransactionFactory::from_parts(
            self.stm,
            Arc::new(self.config),
            Arc::new(RwLock::new(speculative)),
        ))
    }

    /// Validate and build an executor
    ///
    /// # Errors
    /// Returns `IllegalConfiguration` for an inconsistent combination.
    pub fn build_executor(self) -> StmResult<TransactionExecutor> {
        self.build_factory().map(TransactionExecutor::new)
    }
}

/// Creates transactions sharing one configuration
#[derive(Clone)]
pub struct TransactionFactory {
    stm: Stm,
    config: Arc<TransactionConfig>,
    speculative: Arc<RwLock<SpeculativeConfiguration>>,
}

impl fmt::Debug for TransactionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFactory")
            .field("family", &self.config.family_name)
            .field("speculative", &*self.speculative.read())
            .finish()
    }
}

impl TransactionFactory {
    pub(crate) fn from_parts(
        stm: Stm,
        config: Arc<TransactionConfig>,
        speculative: Arc<RwLock<SpeculativeConfiguration>>,
    ) -> Self {
        TransactionFactory {
            stm,
            config,
            speculative,
        }
    }

    /// Runtime the transactions belong to
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Shared configuration
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Current sizing decisions
    pub fn speculative_configuration(&self) -> SpeculativeConfiguration {
        *self.speculative.read()
    }

    /// Begin a transaction
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(self.stm.clone(), Arc::clone(&self.config), Arc::clone(&self.speculative))
    }

    /// Grow the transactions of this factory after `failure`
    pub fn upgrade_after_speculative_failure(&self, failure: SpeculativeFailure) {
        let mut speculative = self.speculative.write();
        let upgraded = speculative.upgraded(failure);
        if upgraded != *speculative && self.config.trace_level == TraceLevel::Coarse {
            debug!(
                "{}: speculative upgrade after {} to {:?}",
                self.config.family_name,
                failure,
                upgraded.attachment_strategy()
            );
        }
        *speculative = upgraded;
    }
}
