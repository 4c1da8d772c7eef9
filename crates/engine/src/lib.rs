//! Transaction engine for tranquil
//!
//! This crate ties the concurrency primitives into a software transactional
//! memory:
//! - [`Stm`]: runtime owning the version clock and conflict counter
//! - [`Ref`]: transactional reference to a value of type `T`
//! - [`Transaction`]: state machine coordinating the references it opened
//! - [`TransactionFactoryBuilder`] / [`TransactionFactory`]: configuration
//! - [`TransactionExecutor`]: the atomic-block driver (conflict, retry, speculative upgrade)
//!
//! # Example
//!
//! ```ignore
//! let stm = Stm::new();
//! let balance = stm.new_ref(10i64);
//! stm.atomically(|tx| balance.alter(tx, |v| v + 5))?;
//! assert_eq!(balance.atomic_get()?, 15);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod executor;
pub mod factory;
pub mod stm;
pub mod tranlocal;
pub mod transaction;
pub mod tref;

pub use backoff::{BackoffPolicy, ExponentialBackoffPolicy, NoBackoff};
pub use config::{TransactionConfig, DEFAULT_FAMILY_NAME, MAX_POOR_MANS_CONFLICT_SCAN_LENGTH};
pub use executor::TransactionExecutor;
pub use factory::{SpeculativeConfiguration, TransactionFactory, TransactionFactoryBuilder};
pub use stm::Stm;
pub use tranlocal::{Tranlocal, TranlocalMode};
pub use transaction::{AttachmentStrategy, Transaction};
pub use tref::{Ref, TxnValue};
