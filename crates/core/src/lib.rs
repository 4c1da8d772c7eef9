//! Core types and traits for the tranquil transactional memory engine
//!
//! This crate defines the vocabulary shared by every other crate:
//! - Error taxonomy: [`StmError`], [`ControlFlow`], [`SpeculativeFailure`]
//! - Identity and versioning: [`RefId`], [`StmId`], [`Version`]
//! - Policy enums: [`LockMode`], [`IsolationLevel`], [`LockLevel`],
//!   [`PropagationLevel`], [`TraceLevel`]
//! - File-based configuration: [`StmConfig`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{StmConfig, MAX_READ_BIASED_THRESHOLD};
pub use error::{ControlFlow, SpeculativeFailure, StmError, StmResult};
pub use types::{
    IsolationLevel, LockLevel, LockMode, PropagationLevel, RefId, StmId, TraceLevel,
    TransactionStatus, Version,
};
