//! Convenient imports for tranquil.
//!
//! ```ignore
//! use tranquil::prelude::*;
//!
//! let stm = Stm::new();
//! let counter = stm.new_ref(0u64);
//! stm.atomically(|tx| counter.alter(tx, |v| v + 1))?;
//! ```

// Entry points
pub use tranquil_engine::{Ref, Stm, Transaction, TransactionExecutor};

// Errors
pub use tranquil_core::{ControlFlow, StmError, StmResult};

// Policies
pub use tranquil_core::{IsolationLevel, LockLevel, LockMode, PropagationLevel};
