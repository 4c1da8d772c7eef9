//! # Tranquil
//!
//! Software transactional memory for Rust.
//!
//! Shared state lives in [`Ref`] cells. Code that reads and writes several
//! refs runs inside a [`Transaction`]; either every write becomes visible at
//! once, or none does.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tranquil::prelude::*;
//!
//! let stm = Stm::new();
//! let from = stm.new_ref(100i64);
//! let to = stm.new_ref(0i64);
//!
//! stm.atomically(|tx| {
//!     from.alter(tx, |v| v - 10)?;
//!     to.alter(tx, |v| v + 10)
//! })?;
//! ```
//!
//! ## Layers
//!
//! 1. **Atomic** - single-ref operations without a transaction: `r.atomic_get()`
//! 2. **Executor** - a body run until it commits: `stm.atomically(|tx| ...)`
//! 3. **Manual** - explicit lifecycle: `stm.begin()`, `tx.commit()`
//!
//! Executors with a custom configuration come from
//! [`Stm::transaction_factory_builder`].
//!
//! ## Crates
//!
//! - [`tranquil_core`] - errors, identifiers, policy enums, configuration
//! - [`tranquil_concurrency`] - version clock, ownership records, latches
//! - [`tranquil_engine`] - references, transactions, executors

#![warn(missing_docs)]

pub mod prelude;

pub use tranquil_concurrency;
pub use tranquil_core;
pub use tranquil_engine;

pub use tranquil_core::{
    ControlFlow, IsolationLevel, LockLevel, LockMode, PropagationLevel, SpeculativeFailure,
    StmConfig, StmError, StmResult, TraceLevel, TransactionStatus, Version,
};
pub use tranquil_engine::{
    Ref, Stm, Transaction, TransactionConfig, TransactionExecutor, TransactionFactory,
    TransactionFactoryBuilder, TxnValue,
};
