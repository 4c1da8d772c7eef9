//! Global counters shared by every transaction of an engine
//!
//! Both counters start at zero and only grow. They are padded to a cache line
//! so that heavy commit traffic on one does not slow down readers of the other.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use tranquil_core::Version;

/// Monotonic commit clock
///
/// Each commit that publishes at least one write claims the next value with
/// [`tick`](Self::tick). Because the clock is shared by all references, the
/// versions committed to one reference form a strictly increasing sequence.
#[derive(Debug, Default)]
pub struct GlobalVersionClock {
    value: CachePadded<AtomicU64>,
}

impl GlobalVersionClock {
    /// Create a clock at version 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version, the highest value claimed so far
    pub fn current(&self) -> Version {
        self.value.load(Ordering::Acquire)
    }

    /// Claim the next version
    pub fn tick(&self) -> Version {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Counter forcing read-set rescans
///
/// A writer that locks a reference while other transactions are arrived at it
/// (or while the record is read-biased and arrivals are untracked) signals a
/// conflict. Transactions using the rich man's conflict scan compare the counter
/// with their local copy and only rescan their reads when it moved.
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: CachePadded<AtomicU64>,
}

impl GlobalConflictCounter {
    /// Create a counter at 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Current conflict count
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Record a conflicting write
    pub fn signal_conflict(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}
