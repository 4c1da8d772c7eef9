//! STM Integration Tests
//!
//! End-to-end behaviour of the engine through its public API: atomicity,
//! isolation anomalies, locking, blocking retry, the executor's retry policy
//! and file-based configuration.
//!
//! ```bash
//! cargo test --test stm
//! cargo test --test stm isolation::
//! ```

#[path = "../common/mod.rs"]
mod common;

mod atomicity;
mod blocking;
mod config;
mod executor;
mod isolation;
mod locking;
