//! Error types for the transactional memory engine
//!
//! Errors fall into two groups:
//!
//! - **Control-flow signals** ([`ControlFlow`]): read conflicts, lock conflicts,
//!   speculative capacity failures and the explicit retry request. They are
//!   produced by low-level operations, carried through `?`, and consumed by the
//!   transaction executor, which aborts and re-runs the transactional body.
//!   Application code normally never sees them.
//! - **User-visible failures**: API misuse, exhausted retry budgets, blocking
//!   outcomes, foreign references, configuration problems and application
//!   errors raised inside a transactional body.
//!
//! Every failure path aborts the owning transaction before the error leaves
//! the engine, so no partial write is ever visible.

use std::fmt;
use thiserror::Error;

/// Reason a speculative configuration turned out to be too optimistic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculativeFailure {
    /// More references were attached than the attachment strategy can hold
    TransactionTooSmall {
        /// Number of attachments the transaction needed
        required: usize,
    },
    /// The read set outgrew the poor man's conflict scan
    RichMansConflictScanRequired,
}

impl fmt::Display for SpeculativeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeculativeFailure::TransactionTooSmall { required } => {
                write!(f, "transaction too small, {} attachments required", required)
            }
            SpeculativeFailure::RichMansConflictScanRequired => {
                f.write_str("rich man's conflict scan required")
            }
        }
    }
}

/// Control-flow signal consumed by the transaction executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// A read observed a reference that changed after the read version
    ReadConflict,
    /// A lock could not be acquired, or a tracked read was invalidated
    ReadWriteConflict,
    /// A write could not be published
    WriteConflict,
    /// The transaction must be rebuilt with a larger configuration
    SpeculativeConfiguration(SpeculativeFailure),
    /// The body asked to block until a read reference changes
    Retry,
}

impl fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlFlow::ReadConflict => f.write_str("read conflict"),
            ControlFlow::ReadWriteConflict => f.write_str("read-write conflict"),
            ControlFlow::WriteConflict => f.write_str("write conflict"),
            ControlFlow::SpeculativeConfiguration(reason) => {
                write!(f, "speculative configuration failure: {}", reason)
            }
            ControlFlow::Retry => f.write_str("retry"),
        }
    }
}

/// All engine errors
#[derive(Debug, Error)]
pub enum StmError {
    /// Internal signal handled by the executor
    #[error("control flow: {0}")]
    ControlFlow(ControlFlow),

    /// Operation on a committed or aborted transaction
    #[error("dead transaction: {0}")]
    DeadTransaction(String),

    /// Operation not allowed once the transaction is prepared
    #[error("prepared transaction: {0}")]
    PreparedTransaction(String),

    /// Write attempted in a readonly transaction
    #[error("readonly transaction: {0}")]
    Readonly(String),

    /// Retry budget exhausted
    #[error("too many retries: {family} gave up after {attempts} attempts")]
    TooManyRetries {
        /// Family name of the transaction
        family: String,
        /// Number of attempts that were made
        attempts: usize,
    },

    /// Blocking retry timed out
    #[error("retry timed out: {0}")]
    RetryTimeout(String),

    /// Blocking retry was interrupted
    #[error("retry interrupted: {0}")]
    RetryInterrupted(String),

    /// Blocking retry is disabled for this transaction
    #[error("blocking retry not allowed: {0}")]
    NoBlockingRetryAllowed(String),

    /// Retry without any tracked read to wait on
    #[error("retry not possible: {0}")]
    RetryNotPossible(String),

    /// Reference belongs to another engine instance
    #[error("stm mismatch: {0}")]
    StmMismatch(String),

    /// Internal invariant violation
    #[error("panic: {0}")]
    Panic(String),

    /// Non-transactional operation could not obtain the lock
    #[error("locked: {0}")]
    Locked(String),

    /// Propagation level requires an outer transaction
    #[error("transaction required: {0}")]
    TransactionRequired(String),

    /// Propagation level forbids an outer transaction
    #[error("transaction not allowed: {0}")]
    TransactionNotAllowed(String),

    /// Transaction was marked abort-only and could not commit
    #[error("abort only: {0}")]
    AbortOnly(String),

    /// Builder validation failed
    #[error("illegal configuration: {0}")]
    IllegalConfiguration(String),

    /// Configuration file could not be parsed
    #[error("configuration error: {0}")]
    Config(String),

    /// Application error raised inside a transactional body
    #[error("user error: {0}")]
    User(Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for engine operations
pub type StmResult<T> = std::result::Result<T, StmError>;

impl StmError {
    /// Wrap an application error so it crosses the transaction boundary
    pub fn user<E>(e: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StmError::User(e.into())
    }

    /// Check if this error is an executor-internal signal
    pub fn is_control_flow(&self) -> bool {
        matches!(self, StmError::ControlFlow(_))
    }

    /// Check if the executor may re-run the body after this error
    ///
    /// The explicit retry signal is excluded: it blocks instead of looping.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StmError::ControlFlow(
                ControlFlow::ReadConflict
                    | ControlFlow::ReadWriteConflict
                    | ControlFlow::WriteConflict
                    | ControlFlow::SpeculativeConfiguration(_)
            )
        )
    }

    /// Check if this is a conflict of any kind
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StmError::ControlFlow(
                ControlFlow::ReadConflict
                    | ControlFlow::ReadWriteConflict
                    | ControlFlow::WriteConflict
            )
        )
    }

    /// The control-flow signal, if this is one
    pub fn control_flow(&self) -> Option<ControlFlow> {
        match self {
            StmError::ControlFlow(cf) => Some(*cf),
            _ => None,
        }
    }

    /// Check if this is an engine bug
    pub fn is_serious(&self) -> bool {
        matches!(self, StmError::Panic(_))
    }
}

impl From<ControlFlow> for StmError {
    fn from(cf: ControlFlow) -> Self {
        StmError::ControlFlow(cf)
    }
}

impl From<SpeculativeFailure> for StmError {
    fn from(reason: SpeculativeFailure) -> Self {
        StmError::ControlFlow(ControlFlow::SpeculativeConfiguration(reason))
    }
}

impl From<toml::de::Error> for StmError {
    fn from(e: toml::de::Error) -> Self {
        StmError::Config(e.to_string())
    }
}
