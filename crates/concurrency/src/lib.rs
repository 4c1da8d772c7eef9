//! Concurrency primitives for the tranquil transactional memory engine
//!
//! This crate holds the shared-memory building blocks the transaction layer
//! coordinates through:
//! - [`GlobalVersionClock`]: every commit claims its next value
//! - [`GlobalConflictCounter`]: bumped when a write may invalidate arrived readers
//! - [`Orec`]: per-reference bit-packed ownership record (locks, surplus, read bias)
//! - [`Latch`] and [`Interrupter`]: single-use wakeup for blocking retry
//! - [`ListenerRegistry`]: per-reference lock-free list of waiting latches
//!
//! Clock, counter, orec and registry state is mutated through atomic
//! compare-and-swap loops and never parks a thread. A blocking retry waiting
//! in [`Latch::await_open`] is the only wait that does; the latch's own mutex
//! guards nothing but its open flag.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod latch;
pub mod listeners;
pub mod orec;

pub use clock::{GlobalConflictCounter, GlobalVersionClock};
pub use latch::{AwaitOutcome, Interrupter, Latch};
pub use listeners::{ListenerRegistry, Registration};
pub use orec::{Arrival, Orec, OrecState, DEFAULT_READ_BIASED_THRESHOLD, SPIN_YIELD};
