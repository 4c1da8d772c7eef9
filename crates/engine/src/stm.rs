//! The STM runtime
//!
//! An [`Stm`] owns the only global mutable state of the engine: the version
//! clock every commit ticks and the conflict counter read-biased updates bump.
//! References and transactions keep a handle to the runtime that created them;
//! mixing runtimes inside one transaction fails with `StmMismatch`.

use crate::config::TransactionConfig;
use crate::executor::TransactionExecutor;
use crate::factory::{SpeculativeConfiguration, TransactionFactory, TransactionFactoryBuilder};
use crate::transaction::Transaction;
use crate::tref::{Ref, TxnValue};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tranquil_concurrency::{GlobalConflictCounter, GlobalVersionClock};
use tranquil_core::{StmConfig, StmId, StmResult, Version};

static GLOBAL: Lazy<Stm> = Lazy::new(Stm::new);

pub(crate) struct StmShared {
    id: StmId,
    clock: GlobalVersionClock,
    conflict_counter: GlobalConflictCounter,
    config: StmConfig,
    default_config: Arc<TransactionConfig>,
    default_speculative: Arc<RwLock<SpeculativeConfiguration>>,
}

/// Handle to an STM runtime
///
/// Cloning is cheap; all clones share the same clock.
#[derive(Clone)]
pub struct Stm {
    inner: Arc<StmShared>,
}

impl fmt::Debug for Stm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .finish()
    }
}

impl PartialEq for Stm {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stm {}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    /// Create a runtime with the default configuration
    pub fn new() -> Self {
        Self::from_validated(StmConfig::default())
    }

    /// Create a runtime from an engine configuration
    ///
    /// # Errors
    /// Returns `IllegalConfiguration` if the configuration is inconsistent.
    pub fn with_config(config: StmConfig) -> StmResult<Self> {
        Ok(Self::from_validated(config.validated()?))
    }

    fn from_validated(config: StmConfig) -> Self {
        let default_config = Arc::new(TransactionConfig::from_stm_config(&config));
        let default_speculative = Arc::new(RwLock::new(SpeculativeConfiguration::new(&default_config)));
        Stm {
            inner: Arc::new(StmShared {
                id: StmId::next(),
                clock: GlobalVersionClock::new(),
                conflict_counter: GlobalConflictCounter::new(),
                config,
                default_config,
                default_speculative,
            }),
        }
    }

    /// Process-wide runtime, created on first use
    pub fn global() -> &'static Stm {
        &GLOBAL
    }

    /// Identity of this runtime
    pub fn id(&self) -> StmId {
        self.inner.id
    }

    /// Engine configuration
    pub fn config(&self) -> &StmConfig {
        &self.inner.config
    }

    /// Current value of the version clock
    pub fn version(&self) -> Version {
        self.inner.clock.current()
    }

    /// Current value of the global conflict counter
    ///
    /// Moves whenever a commit locks a reference over readers that the rich
    /// man's conflict scan cannot see individually.
    pub fn conflict_count(&self) -> u64 {
        self.inner.conflict_counter.count()
    }

    /// Create a reference holding `value` at version 0
    pub fn new_ref<T: TxnValue>(&self, value: T) -> Ref<T> {
        Ref::new(self.clone(), value)
    }

    /// Builder seeded with this runtime's defaults
    pub fn transaction_factory_builder(&self) -> TransactionFactoryBuilder {
        TransactionFactoryBuilder::new(self.clone(), (*self.inner.default_config).clone())
    }

    /// Executor with the default configuration
    ///
    /// All default executors of a runtime share their speculative upgrades.
    pub fn default_executor(&self) -> TransactionExecutor {
        TransactionExecutor::new(TransactionFactory::from_parts(
            self.clone(),
            Arc::clone(&self.inner.default_config),
            Arc::clone(&self.inner.default_speculative),
        ))
    }

    /// Begin a standalone transaction with the default configuration
    ///
    /// The transaction is not speculative: it uses the growable attachment
    /// strategy and the rich man's conflict scan from the start.
    pub fn begin(&self) -> Transaction {
        let speculative = SpeculativeConfiguration::non_speculative(&self.inner.default_config);
        Transaction::new(
            self.clone(),
            Arc::clone(&self.inner.default_config),
            Arc::new(RwLock::new(speculative)),
        )
    }

    /// Run `body` in a transaction with the default executor
    ///
    /// # Errors
    /// Returns the body's non-control-flow error, or `TooManyRetries`.
    pub fn atomically<R, F>(&self, body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        self.default_executor().execute(body)
    }

    pub(crate) fn clock(&self) -> &GlobalVersionClock {
        &self.inner.clock
    }

    pub(crate) fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.inner.conflict_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtimes_are_distinct() {
        let a = Stm::new();
        let b = Stm::new();
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn global_is_shared() {
        assert_eq!(Stm::global(), Stm::global());
    }

    #[test]
    fn with_config_validates() {
        let config = StmConfig {
            spin_count: 0,
            ..StmConfig::default()
        };
        assert!(Stm::with_config(config).is_err());

        let config = StmConfig {
            max_retries: 3,
            ..StmConfig::default()
        };
        let stm = Stm::with_config(config).unwrap();
        assert_eq!(stm.config().max_retries, 3);
    }

    #[test]
    fn version_starts_at_zero() {
        let stm = Stm::new();
        assert_eq!(stm.version(), 0);
        let r = stm.new_ref(1u32);
        assert_eq!(r.atomic_version(), 0);
    }
}
