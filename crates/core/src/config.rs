//! File-based engine configuration
//!
//! `StmConfig` holds the defaults every transaction of an engine starts from.
//! It can be built in code or parsed from TOML:
//!
//! ```toml
//! spin_count = 32
//! max_retries = 500
//! timeout_ms = 2000
//! isolation_level = "Snapshot"
//! lock_level = "LockWrites"
//! trace_level = "Coarse"
//! ```
//!
//! Missing keys take their defaults. Per-transaction overrides go through the
//! transaction factory builder.

use crate::error::{StmError, StmResult};
use crate::types::{IsolationLevel, LockLevel, TraceLevel};
use serde::{Deserialize, Serialize};

/// Largest value representable by the readonly counter of an ownership record
pub const MAX_READ_BIASED_THRESHOLD: u32 = 1023;

/// Engine-wide transaction defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    /// Bounded spin budget used when arriving at a locked ownership record
    pub spin_count: u32,
    /// Number of re-runs allowed after the first attempt
    pub max_retries: usize,
    /// Total time a transaction may spend blocked in retry; `None` waits forever
    pub timeout_ms: Option<u64>,
    /// Whether a blocked retry reacts to interruption
    pub interruptible: bool,
    /// Whether retry may block at all
    pub blocking_allowed: bool,
    /// Default isolation level
    pub isolation_level: IsolationLevel,
    /// Default pessimistic lock level
    pub lock_level: LockLevel,
    /// Skip publishing writes whose value equals the value read
    pub dirty_check: bool,
    /// Keep read-only opens attached to the transaction
    pub track_reads: bool,
    /// Start transactions small and grow them on demand
    pub speculative: bool,
    /// Capacity of the fixed-length attachment strategy
    pub max_fixed_length_size: usize,
    /// Consecutive readonly departures before an ownership record turns read-biased
    pub read_biased_threshold: u32,
    /// Executor logging detail
    pub trace_level: TraceLevel,
}

impl Default for StmConfig {
    fn default() -> Self {
        StmConfig {
            spin_count: 16,
            max_retries: 1000,
            timeout_ms: None,
            interruptible: false,
            blocking_allowed: true,
            isolation_level: IsolationLevel::Serializable,
            lock_level: LockLevel::None,
            dirty_check: true,
            track_reads: true,
            speculative: true,
            max_fixed_length_size: 20,
            read_biased_threshold: 128,
            trace_level: TraceLevel::None,
        }
    }
}

impl StmConfig {
    /// Parse a configuration from TOML text
    ///
    /// The read-biased threshold is clamped to [`MAX_READ_BIASED_THRESHOLD`].
    ///
    /// # Errors
    /// Returns `StmError::Config` if the text is not valid TOML or a field has
    /// the wrong type, and `StmError::IllegalConfiguration` if a value is out of range.
    pub fn from_toml_str(text: &str) -> StmResult<Self> {
        let config: StmConfig = toml::from_str(text)?;
        config.validated()
    }

    /// Check ranges and clamp the read-biased threshold
    pub fn validated(mut self) -> StmResult<Self> {
        if self.spin_count == 0 {
            return Err(StmError::IllegalConfiguration(
                "spin_count must be at least 1".into(),
            ));
        }
        if self.max_fixed_length_size == 0 {
            return Err(StmError::IllegalConfiguration(
                "max_fixed_length_size must be at least 1".into(),
            ));
        }
        if self.isolation_level == IsolationLevel::Serializable && !self.track_reads {
            return Err(StmError::IllegalConfiguration(
                "Serializable isolation requires track_reads".into(),
            ));
        }
        self.read_biased_threshold = self.read_biased_threshold.min(MAX_READ_BIASED_THRESHOLD);
        Ok(self)
    }
}
