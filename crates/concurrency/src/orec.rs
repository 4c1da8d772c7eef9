//! Ownership record
//!
//! Every transactional reference embeds one [`Orec`]: a single `AtomicU64`
//! packing the lock state and the arrival bookkeeping of that reference.
//!
//! # Layout
//!
//! ```text
//! bit  63      exclusive lock
//! bit  62      write lock
//! bit  61      read-biased
//! bits 40..=60 read lock count
//! bits 10..=39 surplus (arrived, not yet departed)
//! bits  0..=9  consecutive readonly departures
//! ```
//!
//! # Arrive / depart
//!
//! A transaction that reads a reference *arrives* (increments the surplus) and
//! *departs* when it is done. A writer locking the record exclusively while the
//! surplus is non-zero knows other readers may be invalidated and reports a
//! conflict, which the committing transaction turns into a bump of the
//! [`GlobalConflictCounter`](crate::GlobalConflictCounter).
//!
//! After `read_biased_threshold` consecutive readonly departures that leave the
//! surplus at zero, the record becomes *read-biased*: arrivals are no longer
//! counted (the surplus is pinned at 1) so read-mostly references stop paying
//! for a CAS per read. The next update resets the record and always reports a
//! conflict.
//!
//! All transitions are CAS loops. Lock acquisition spins for a bounded budget
//! and then reports [`Arrival::Failed`]; nothing here blocks on the OS.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tranquil_core::{LockMode, StmError, StmResult, MAX_READ_BIASED_THRESHOLD};

/// Spins between two voluntary yields while waiting for a lock
pub const SPIN_YIELD: i64 = 8;

/// Default number of readonly departures before a record turns read-biased
pub const DEFAULT_READ_BIASED_THRESHOLD: u32 = 128;

const MASK_EXCLUSIVE_LOCK: u64 = 1 << 63;
const MASK_WRITE_LOCK: u64 = 1 << 62;
const MASK_READ_BIASED: u64 = 1 << 61;
const READ_LOCKS_SHIFT: u32 = 40;
const MASK_READ_LOCKS: u64 = 0x1F_FFFF << READ_LOCKS_SHIFT;
const SURPLUS_SHIFT: u32 = 10;
const MASK_SURPLUS: u64 = 0x3FFF_FFFF << SURPLUS_SHIFT;
const MASK_READONLY_COUNT: u64 = 0x3FF;

/// Largest surplus the record can count
pub const MAX_SURPLUS: u64 = MASK_SURPLUS >> SURPLUS_SHIFT;
/// Largest number of concurrent read locks
pub const MAX_READ_LOCKS: u64 = MASK_READ_LOCKS >> READ_LOCKS_SHIFT;

// ============================================================================
// OrecState
// ============================================================================

/// Decoded view of one ownership record word
///
/// Setters return a new value and leave every other field untouched.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct OrecState(u64);

impl OrecState {
    /// Wrap a raw word
    pub const fn from_bits(bits: u64) -> Self {
        OrecState(bits)
    }

    /// Raw word
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether the exclusive (commit) lock is held
    pub fn has_exclusive_lock(self) -> bool {
        self.0 & MASK_EXCLUSIVE_LOCK != 0
    }

    /// Set or clear the exclusive lock
    pub fn with_exclusive_lock(self, locked: bool) -> Self {
        OrecState((self.0 & !MASK_EXCLUSIVE_LOCK) | if locked { MASK_EXCLUSIVE_LOCK } else { 0 })
    }

    /// Whether the write lock is held
    pub fn has_write_lock(self) -> bool {
        self.0 & MASK_WRITE_LOCK != 0
    }

    /// Set or clear the write lock
    pub fn with_write_lock(self, locked: bool) -> Self {
        OrecState((self.0 & !MASK_WRITE_LOCK) | if locked { MASK_WRITE_LOCK } else { 0 })
    }

    /// Whether arrivals are untracked
    pub fn is_read_biased(self) -> bool {
        self.0 & MASK_READ_BIASED != 0
    }

    /// Set or clear the read-biased flag
    pub fn with_read_biased(self, read_biased: bool) -> Self {
        OrecState((self.0 & !MASK_READ_BIASED) | if read_biased { MASK_READ_BIASED } else { 0 })
    }

    /// Number of read locks held
    pub fn read_lock_count(self) -> u64 {
        (self.0 & MASK_READ_LOCKS) >> READ_LOCKS_SHIFT
    }

    /// Replace the read lock count
    pub fn with_read_lock_count(self, count: u64) -> Self {
        OrecState((self.0 & !MASK_READ_LOCKS) | ((count << READ_LOCKS_SHIFT) & MASK_READ_LOCKS))
    }

    /// Number of arrived transactions that have not departed
    pub fn surplus(self) -> u64 {
        (self.0 & MASK_SURPLUS) >> SURPLUS_SHIFT
    }

    /// Replace the surplus
    pub fn with_surplus(self, surplus: u64) -> Self {
        OrecState((self.0 & !MASK_SURPLUS) | ((surplus << SURPLUS_SHIFT) & MASK_SURPLUS))
    }

    /// Consecutive readonly departures
    pub fn readonly_count(self) -> u32 {
        (self.0 & MASK_READONLY_COUNT) as u32
    }

    /// Replace the readonly count
    pub fn with_readonly_count(self, count: u32) -> Self {
        OrecState((self.0 & !MASK_READONLY_COUNT) | (u64::from(count) & MASK_READONLY_COUNT))
    }

    /// Whether a write or exclusive lock is held
    pub fn has_write_or_exclusive_lock(self) -> bool {
        self.0 & (MASK_EXCLUSIVE_LOCK | MASK_WRITE_LOCK) != 0
    }

    /// Whether any lock is held
    pub fn has_any_lock(self) -> bool {
        self.0 & (MASK_EXCLUSIVE_LOCK | MASK_WRITE_LOCK | MASK_READ_LOCKS) != 0
    }

    /// Strongest lock currently held by anyone
    pub fn lock_mode(self) -> LockMode {
        if self.has_exclusive_lock() {
            LockMode::Exclusive
        } else if self.has_write_lock() {
            LockMode::Write
        } else if self.read_lock_count() > 0 {
            LockMode::Read
        } else {
            LockMode::None
        }
    }

    fn with_lock(self, mode: LockMode) -> StmResult<Self> {
        match mode {
            LockMode::None => Ok(self),
            LockMode::Read => {
                let read_locks = self.read_lock_count();
                if read_locks >= MAX_READ_LOCKS {
                    return Err(invariant_violation("read lock overflow", self));
                }
                Ok(self.with_read_lock_count(read_locks + 1))
            }
            LockMode::Write => Ok(self.with_write_lock(true)),
            LockMode::Exclusive => Ok(self.with_exclusive_lock(true)),
        }
    }

    fn blocks(self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.has_write_or_exclusive_lock(),
            _ => self.has_any_lock(),
        }
    }
}

impl fmt::Debug for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orec")
            .field("exclusive", &self.has_exclusive_lock())
            .field("write", &self.has_write_lock())
            .field("read_locks", &self.read_lock_count())
            .field("surplus", &self.surplus())
            .field("read_biased", &self.is_read_biased())
            .field("readonly_count", &self.readonly_count())
            .finish()
    }
}

impl fmt::Display for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Arrival
// ============================================================================

/// Outcome of an arrive or lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// The spin budget ran out while the record was locked
    Failed,
    /// The arrival (and lock, if requested) was granted
    Granted {
        /// The record is read-biased; the caller has no depart obligation
        unregistered: bool,
        /// Other transactions may have read the value this caller is going to replace
        conflict: bool,
    },
}

impl Arrival {
    /// Whether the operation succeeded
    pub fn is_granted(self) -> bool {
        matches!(self, Arrival::Granted { .. })
    }

    /// Whether the caller must depart later
    pub fn has_depart_obligation(self) -> bool {
        matches!(self, Arrival::Granted { unregistered: false, .. })
    }

    /// Whether the grant carries a conflict
    pub fn has_conflict(self) -> bool {
        matches!(self, Arrival::Granted { conflict: true, .. })
    }
}

// ============================================================================
// Orec
// ============================================================================

/// Per-reference ownership record
#[derive(Debug)]
pub struct Orec {
    state: AtomicU64,
    read_biased_threshold: u32,
}

impl Default for Orec {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BIASED_THRESHOLD)
    }
}

fn spin_pause(remaining: i64) {
    if remaining > 0 && remaining % SPIN_YIELD == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

fn invariant_violation(what: &str, state: OrecState) -> StmError {
    tracing::error!(orec = %state, "{}", what);
    StmError::Panic(format!("{}: {}", what, state))
}

impl Orec {
    /// Create a free, update-biased record
    ///
    /// The threshold is clamped to what the readonly counter can hold.
    pub fn new(read_biased_threshold: u32) -> Self {
        Orec {
            state: AtomicU64::new(0),
            read_biased_threshold: read_biased_threshold.min(MAX_READ_BIASED_THRESHOLD),
        }
    }

    /// Create a record already arrived at and exclusively locked by its creator
    ///
    /// Used for references constructed inside a transaction: nobody else can
    /// read them until the creator commits.
    pub fn new_exclusively_locked(read_biased_threshold: u32) -> Self {
        let initial = OrecState::default()
            .with_surplus(1)
            .with_exclusive_lock(true);
        Orec {
            state: AtomicU64::new(initial.bits()),
            read_biased_threshold: read_biased_threshold.min(MAX_READ_BIASED_THRESHOLD),
        }
    }

    /// Snapshot of the current state
    pub fn state(&self) -> OrecState {
        OrecState(self.state.load(Ordering::Acquire))
    }

    /// Threshold for the read-biased transition
    pub fn read_biased_threshold(&self) -> u32 {
        self.read_biased_threshold
    }

    /// Strongest lock currently held by anyone
    pub fn lock_mode(&self) -> LockMode {
        self.state().lock_mode()
    }

    /// Whether the exclusive lock is held
    pub fn has_exclusive_lock(&self) -> bool {
        self.state().has_exclusive_lock()
    }

    fn cas(&self, current: OrecState, next: OrecState) -> bool {
        self.state
            .compare_exchange_weak(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Spin until no exclusive lock is held
    ///
    /// Returns false if the lock is still held after `spin_count` checks. Used
    /// by the poor man's conflict scan, which reads without arriving.
    pub fn wait_for_exclusive_lock_to_become_free(&self, spin_count: u32) -> bool {
        let mut remaining = i64::from(spin_count);
        loop {
            if !self.has_exclusive_lock() {
                return true;
            }
            remaining -= 1;
            if remaining < 0 {
                return false;
            }
            spin_pause(remaining);
        }
    }

    /// Arrive without locking
    ///
    /// Spins while the record is exclusively locked.
    pub fn arrive(&self, spin_count: u32) -> StmResult<Arrival> {
        let mut remaining = i64::from(spin_count);
        loop {
            let current = self.state();

            if current.has_exclusive_lock() {
                remaining -= 1;
                if remaining < 0 {
                    return Ok(Arrival::Failed);
                }
                spin_pause(remaining);
                continue;
            }

            let read_biased = current.is_read_biased();
            let surplus = self.next_arrival_surplus(current)?;
            if read_biased && surplus == current.surplus() {
                return Ok(Arrival::Granted {
                    unregistered: true,
                    conflict: false,
                });
            }

            if self.cas(current, current.with_surplus(surplus)) {
                return Ok(Arrival::Granted {
                    unregistered: read_biased,
                    conflict: false,
                });
            }
        }
    }

    /// Arrive and acquire `mode` in one step
    ///
    /// If either part fails there is no state change. An exclusive lock taken
    /// while others are arrived reports a conflict.
    pub fn arrive_and_lock(&self, spin_count: u32, mode: LockMode) -> StmResult<Arrival> {
        if mode == LockMode::None {
            return Err(invariant_violation("arrive_and_lock without a lock mode", self.state()));
        }

        let mut remaining = i64::from(spin_count);
        loop {
            let current = self.state();

            if current.blocks(mode) {
                remaining -= 1;
                if remaining < 0 {
                    return Ok(Arrival::Failed);
                }
                spin_pause(remaining);
                continue;
            }

            let current_surplus = current.surplus();
            let surplus = self.next_arrival_surplus(current)?;
            let next = current.with_surplus(surplus).with_lock(mode)?;

            if self.cas(current, next) {
                return Ok(Arrival::Granted {
                    unregistered: current.is_read_biased(),
                    conflict: mode == LockMode::Exclusive && current_surplus > 0,
                });
            }
        }
    }

    /// Acquire `mode` after an earlier successful, registered arrive
    ///
    /// An exclusive lock reports a conflict if anybody besides the caller is arrived.
    pub fn lock_after_arrive(&self, spin_count: u32, mode: LockMode) -> StmResult<Arrival> {
        if mode == LockMode::None {
            return Err(invariant_violation("lock_after_arrive without a lock mode", self.state()));
        }

        let mut remaining = i64::from(spin_count);
        loop {
            let current = self.state();

            if current.is_read_biased() {
                return Err(invariant_violation("lock_after_arrive on a read-biased orec", current));
            }

            if current.blocks(mode) {
                remaining -= 1;
                if remaining < 0 {
                    return Ok(Arrival::Failed);
                }
                spin_pause(remaining);
                continue;
            }

            let surplus = current.surplus();
            if surplus == 0 {
                return Err(invariant_violation("lock_after_arrive without surplus", current));
            }

            if self.cas(current, current.with_lock(mode)?) {
                return Ok(Arrival::Granted {
                    unregistered: false,
                    conflict: mode == LockMode::Exclusive && surplus > 1,
                });
            }
        }
    }

    /// Upgrade the caller's read lock to a write or exclusive lock
    ///
    /// Spins while other read locks are held.
    pub fn upgrade_read_lock(&self, spin_count: u32, exclusive: bool) -> StmResult<Arrival> {
        let mut remaining = i64::from(spin_count);
        loop {
            let current = self.state();
            let read_locks = current.read_lock_count();

            if read_locks == 0 {
                return Err(invariant_violation("upgrade_read_lock without a read lock", current));
            }

            if read_locks > 1 {
                remaining -= 1;
                if remaining < 0 {
                    return Ok(Arrival::Failed);
                }
                spin_pause(remaining);
                continue;
            }

            let next = current.with_read_lock_count(0);
            let next = if exclusive {
                next.with_exclusive_lock(true)
            } else {
                next.with_write_lock(true)
            };

            if self.cas(current, next) {
                return Ok(Arrival::Granted {
                    unregistered: current.is_read_biased(),
                    conflict: exclusive && (current.is_read_biased() || current.surplus() > 1),
                });
            }
        }
    }

    /// Upgrade the caller's write lock to the exclusive lock
    pub fn upgrade_write_lock_to_exclusive(&self) -> StmResult<Arrival> {
        loop {
            let current = self.state();

            if current.has_exclusive_lock() {
                return Ok(Arrival::Granted {
                    unregistered: current.is_read_biased(),
                    conflict: false,
                });
            }

            if !current.has_write_lock() {
                return Err(invariant_violation("upgrade without a write lock", current));
            }

            let next = current.with_write_lock(false).with_exclusive_lock(true);
            if self.cas(current, next) {
                return Ok(Arrival::Granted {
                    unregistered: current.is_read_biased(),
                    conflict: current.is_read_biased() || current.surplus() > 1,
                });
            }
        }
    }

    /// Depart after an unlocked read
    ///
    /// Counts a readonly departure and turns the record read-biased once the
    /// threshold is reached with nobody else arrived.
    pub fn depart_after_reading(&self) -> StmResult<()> {
        loop {
            let current = self.state();

            let surplus = current.surplus();
            if surplus == 0 {
                return Err(invariant_violation("depart_after_reading without surplus", current));
            }
            if current.is_read_biased() {
                return Err(invariant_violation("depart_after_reading on a read-biased orec", current));
            }
            if surplus <= 1 && current.has_any_lock() {
                return Err(invariant_violation("lock held without enough surplus", current));
            }

            let surplus = surplus - 1;
            let (read_biased, readonly_count) = self.count_readonly_departure(current, surplus);
            let next = current
                .with_surplus(surplus)
                .with_read_biased(read_biased)
                .with_readonly_count(readonly_count);

            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    /// Depart after a read and release whatever lock the caller holds
    pub fn depart_after_reading_and_unlock(&self) -> StmResult<()> {
        loop {
            let current = self.state();

            let surplus = current.surplus();
            if surplus == 0 {
                return Err(invariant_violation("depart_after_reading_and_unlock without surplus", current));
            }
            let read_locks = current.read_lock_count();
            if read_locks == 0 && !current.has_write_or_exclusive_lock() {
                return Err(invariant_violation("depart_after_reading_and_unlock without a lock", current));
            }
            if current.is_read_biased() {
                return Err(invariant_violation("depart_after_reading_and_unlock on a read-biased orec", current));
            }

            let surplus = surplus - 1;
            let (read_biased, readonly_count) = self.count_readonly_departure(current, surplus);
            let unlocked = if read_locks > 0 {
                current.with_read_lock_count(read_locks - 1)
            } else {
                current.with_exclusive_lock(false).with_write_lock(false)
            };
            let next = unlocked
                .with_surplus(surplus)
                .with_read_biased(read_biased)
                .with_readonly_count(readonly_count);

            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    /// Depart after publishing an update and release the exclusive lock
    ///
    /// A read-biased record is reset to update-biased: its untracked readers
    /// are all considered conflicted.
    pub fn depart_after_update_and_unlock(&self) -> StmResult<()> {
        loop {
            let current = self.state();

            if !current.has_exclusive_lock() {
                return Err(invariant_violation("depart_after_update_and_unlock without the exclusive lock", current));
            }

            let surplus = current.surplus();
            if surplus == 0 {
                return Err(invariant_violation("depart_after_update_and_unlock without surplus", current));
            }

            let surplus = if current.is_read_biased() {
                if surplus > 1 {
                    return Err(invariant_violation("read-biased orec with surplus above 1", current));
                }
                0
            } else {
                surplus - 1
            };

            let next = OrecState::default().with_surplus(surplus);
            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    /// Depart after a failure and release whatever lock the caller holds
    ///
    /// The surplus of a read-biased record is left alone, since its arrivals
    /// were never counted.
    pub fn depart_after_failure_and_unlock(&self) -> StmResult<()> {
        loop {
            let current = self.state();

            let write_or_exclusive = current.has_write_or_exclusive_lock();
            let read_locks = current.read_lock_count();
            if !write_or_exclusive && read_locks == 0 {
                return Err(invariant_violation("depart_after_failure_and_unlock without a lock", current));
            }

            let surplus = current.surplus();
            if surplus == 0 {
                return Err(invariant_violation("depart_after_failure_and_unlock without surplus", current));
            }

            let surplus = if current.is_read_biased() { surplus } else { surplus - 1 };
            let next = current.with_surplus(surplus);
            let next = if write_or_exclusive {
                next.with_exclusive_lock(false).with_write_lock(false)
            } else {
                next.with_read_lock_count(read_locks - 1)
            };

            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    /// Depart after a failure when the caller holds no lock
    pub fn depart_after_failure(&self) -> StmResult<()> {
        loop {
            let current = self.state();

            if current.is_read_biased() {
                return Err(invariant_violation("depart_after_failure on a read-biased orec", current));
            }

            let surplus = current.surplus();
            if current.has_exclusive_lock() {
                if surplus < 2 {
                    return Err(invariant_violation("exclusive lock held without enough surplus", current));
                }
            } else if surplus == 0 {
                return Err(invariant_violation("depart_after_failure without surplus", current));
            }

            if self.cas(current, current.with_surplus(surplus - 1)) {
                return Ok(());
            }
        }
    }

    /// Release a lock taken through an unregistered (read-biased) arrival
    pub fn unlock_by_unregistered(&self) -> StmResult<()> {
        loop {
            let current = self.state();

            if !current.is_read_biased() {
                return Err(invariant_violation("unlock_by_unregistered on an update-biased orec", current));
            }

            let write_or_exclusive = current.has_write_or_exclusive_lock();
            let read_locks = current.read_lock_count();
            if !write_or_exclusive && read_locks == 0 {
                return Err(invariant_violation("unlock_by_unregistered without a lock", current));
            }
            if current.surplus() > 1 {
                return Err(invariant_violation("read-biased orec with surplus above 1", current));
            }

            let next = if write_or_exclusive {
                current.with_exclusive_lock(false).with_write_lock(false)
            } else {
                current.with_read_lock_count(read_locks - 1)
            };

            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    fn next_arrival_surplus(&self, current: OrecState) -> StmResult<u64> {
        let surplus = current.surplus();
        if current.is_read_biased() {
            match surplus {
                0 => Ok(1),
                1 => Ok(1),
                _ => Err(invariant_violation("read-biased orec with surplus above 1", current)),
            }
        } else if surplus >= MAX_SURPLUS {
            Err(invariant_violation("surplus overflow", current))
        } else {
            Ok(surplus + 1)
        }
    }

    fn count_readonly_departure(&self, current: OrecState, surplus_after: u64) -> (bool, u32) {
        let threshold = self.read_biased_threshold;
        let mut readonly_count = current.readonly_count();
        if readonly_count < threshold {
            readonly_count += 1;
        }
        if surplus_after == 0 && readonly_count == threshold {
            (true, 0)
        } else {
            (false, readonly_count)
        }
    }
}
