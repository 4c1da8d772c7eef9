//! The atomic-block driver
//!
//! A [`TransactionExecutor`] runs a transactional body until it commits:
//!
//! | Outcome of an attempt | Action |
//! |-----------------------|--------|
//! | commit succeeds | return the body's value |
//! | read, read-write or write conflict | abort, back off, re-run |
//! | speculative failure | abort, upgrade the factory, re-run |
//! | explicit retry | register listeners, abort, block, re-run |
//! | any other error | abort, return the error |
//!
//! Re-runs are bounded by `max_retries`; exhausting the budget returns
//! `TooManyRetries`. Speculative upgrades do not count as attempts.

use crate::factory::TransactionFactory;
use crate::transaction::Transaction;
use std::sync::Arc;
use tracing::{debug, warn};
use tranquil_concurrency::Interrupter;
use tranquil_core::{ControlFlow, PropagationLevel, StmError, StmResult, TraceLevel};

/// Runs transactional bodies with automatic conflict handling
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    factory: TransactionFactory,
}

impl TransactionExecutor {
    /// Create an executor drawing transactions from `factory`
    pub fn new(factory: TransactionFactory) -> Self {
        TransactionExecutor { factory }
    }

    /// Factory the transactions come from
    pub fn factory(&self) -> &TransactionFactory {
        &self.factory
    }

    /// Run `body` until it commits
    ///
    /// # Errors
    /// The first error of the body that is not a control-flow signal, a
    /// blocking retry outcome, or `TooManyRetries`.
    pub fn execute<R, F>(&self, body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        self.execute_in(None, body)
    }

    /// Run `body` until it commits; `interrupter` can cut a blocking retry short
    ///
    /// Interruption is only observed if the configuration is interruptible.
    pub fn execute_interruptible<R, F>(&self, interrupter: &Arc<Interrupter>, body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        self.run(Some(interrupter), body)
    }

    /// Run `body` honouring the propagation level towards `outer`
    ///
    /// Joining an outer transaction runs `body` once inside it; conflicts are
    /// left to the outer transaction's executor.
    ///
    /// # Errors
    /// `TransactionRequired` for `Mandatory` without an outer transaction,
    /// `TransactionNotAllowed` for `Never` with one.
    pub fn execute_in<R, F>(&self, outer: Option<&mut Transaction>, mut body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        let config = self.factory.config();
        match (config.propagation_level, outer) {
            (PropagationLevel::RequiresNew, _) => self.run(None, body),
            (PropagationLevel::Mandatory, None) => Err(StmError::TransactionRequired(format!(
                "{} must run inside a transaction",
                config.family_name
            ))),
            (PropagationLevel::Never, Some(_)) => Err(StmError::TransactionNotAllowed(format!(
                "{} must not run inside a transaction",
                config.family_name
            ))),
            (PropagationLevel::Requires | PropagationLevel::Mandatory | PropagationLevel::Supports, Some(outer)) => {
                body(outer)
            }
            (_, None) => self.run(None, body),
        }
    }

    fn run<R, F>(&self, interrupter: Option<&Arc<Interrupter>>, mut body: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        let config = self.factory.config();
        let family = &config.family_name;
        let traced = config.trace_level == TraceLevel::Coarse;

        let mut tx = self.factory.new_transaction();
        if let Some(interrupter) = interrupter {
            tx.set_interrupter(Arc::clone(interrupter));
        }

        loop {
            let error = match body(&mut tx) {
                Ok(value) => match tx.commit() {
                    Ok(()) => return Ok(value),
                    Err(error) => error,
                },
                Err(error) => error,
            };

            match error.control_flow() {
                Some(ControlFlow::Retry) => {
                    if traced {
                        debug!("{}: attempt {} blocks on retry", family, tx.attempt());
                    }
                    tx.await_update()?;
                    if traced {
                        debug!("{}: attempt {} woken up", family, tx.attempt());
                    }
                }
                Some(ControlFlow::SpeculativeConfiguration(failure)) => {
                    tx.abort()?;
                    self.factory.upgrade_after_speculative_failure(failure);
                    tx.speculative_reset();
                    continue;
                }
                Some(conflict) => {
                    tx.abort()?;
                    if traced {
                        debug!("{}: attempt {} failed with {}", family, tx.attempt(), conflict);
                    }
                    config.backoff_policy.delay(tx.attempt());
                }
                None => {
                    if tx.is_alive() {
                        tx.abort()?;
                    }
                    return Err(error);
                }
            }

            if !tx.soft_reset() {
                warn!("{}: too many retries after {} attempts", family, tx.attempt());
                return Err(StmError::TooManyRetries {
                    family: family.clone(),
                    attempts: tx.attempt(),
                });
            }
        }
    }
}
