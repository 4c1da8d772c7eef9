//! Core types for the transactional memory engine
//!
//! This module defines the fundamental types used throughout the system:
//! - [`Version`]: Commit version claimed from the global version clock
//! - [`RefId`]: Identity of a transactional reference
//! - [`StmId`]: Identity of an engine instance
//! - [`LockMode`]: Lock strength held on an ownership record
//! - [`TransactionStatus`]: Lifecycle state of a transaction
//! - Policy enums: [`IsolationLevel`], [`LockLevel`], [`PropagationLevel`], [`TraceLevel`]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Commit version
///
/// Every commit claims the next value of the global version clock. A reference
/// that was never written carries version 0.
pub type Version = u64;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STM_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transactional reference
///
/// Ids are allocated from a process-wide counter and never reused, so they are
/// stable keys for attachment lookups inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefId(u64);

impl RefId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        RefId(NEXT_REF_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Unique identifier for an engine instance
///
/// Used to reject references created by one engine from being opened by a
/// transaction of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmId(u64);

impl StmId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        StmId(NEXT_STM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stm#{}", self.0)
    }
}

/// Lock strength on an ownership record
///
/// Ordered from weakest to strongest, so `max` picks the stronger of two modes.
///
/// | Mode | Other readers | Other read locks | Other writers |
/// |------|---------------|------------------|---------------|
/// | None | yes | yes | yes |
/// | Read | yes | yes | no |
/// | Write | yes | no | no |
/// | Exclusive | no | no | no |
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LockMode {
    /// No lock
    #[default]
    None,
    /// Shared lock; prevents writers from committing
    Read,
    /// Prevents other lockers; readers may still read the committed value
    Write,
    /// Commit lock; nobody else can read, lock or write
    Exclusive,
}

/// Lifecycle state of a transaction
///
/// State transitions:
/// - `Active` → `Prepared` (prepare)
/// - `Active` / `Prepared` → `Committed` (commit)
/// - `Active` / `Prepared` → `Aborted` (abort, conflict, retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Transaction is executing and can open references
    Active,
    /// All write locks are held, commit cannot fail on conflicts anymore
    Prepared,
    /// Transaction committed
    Committed,
    /// Transaction was aborted
    Aborted,
}

impl TransactionStatus {
    /// Whether the transaction can still commit or abort
    pub fn is_alive(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Prepared)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Isolation level of a transaction
///
/// | Level | Inconsistent reads | Write skew |
/// |-------|--------------------|------------|
/// | ReadCommitted | allowed | allowed |
/// | Snapshot | prevented | allowed |
/// | Serializable | prevented | prevented |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads are only guaranteed to see committed data
    ReadCommitted,
    /// Reads form a consistent snapshot; write skew is possible
    Snapshot,
    /// Full serializability for all tracked reads
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Whether two transactions may commit writes based on each other's pre-images
    pub fn is_write_skew_allowed(&self) -> bool {
        !matches!(self, IsolationLevel::Serializable)
    }

    /// Whether reads are exempt from the read-consistency scan
    pub fn is_inconsistent_read_allowed(&self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }
}

/// Pessimistic locking applied when references are opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Fully optimistic; locks are only taken during prepare
    #[default]
    None,
    /// Write lock on every reference opened for write
    LockWrites,
    /// Exclusive lock on every reference opened for write
    PrivatizeWrites,
    /// Read lock on every read, write lock on every write
    LockReads,
    /// Exclusive lock on every reference that is opened
    PrivatizeReads,
}

impl LockLevel {
    /// Lock mode applied when a reference is opened for read
    pub fn read_lock_mode(&self) -> LockMode {
        match self {
            LockLevel::None | LockLevel::LockWrites | LockLevel::PrivatizeWrites => LockMode::None,
            LockLevel::LockReads => LockMode::Read,
            LockLevel::PrivatizeReads => LockMode::Exclusive,
        }
    }

    /// Lock mode applied when a reference is opened for write
    pub fn write_lock_mode(&self) -> LockMode {
        match self {
            LockLevel::None => LockMode::None,
            LockLevel::LockWrites | LockLevel::LockReads => LockMode::Write,
            LockLevel::PrivatizeWrites | LockLevel::PrivatizeReads => LockMode::Exclusive,
        }
    }
}

/// How an atomic block treats an already running outer transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationLevel {
    /// Join the outer transaction, or start a new one
    #[default]
    Requires,
    /// Always start an independent transaction
    RequiresNew,
    /// Fail unless an outer transaction exists
    Mandatory,
    /// Fail if an outer transaction exists
    Never,
    /// Join the outer transaction if there is one
    Supports,
}

/// Amount of lifecycle logging emitted by the executor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraceLevel {
    /// No per-attempt events
    #[default]
    None,
    /// Conflicts, retries and speculative upgrades are logged
    Coarse,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_modes_are_ordered_by_strength() {
        assert!(LockMode::None < LockMode::Read);
        assert!(LockMode::Read < LockMode::Write);
        assert!(LockMode::Write < LockMode::Exclusive);
        assert_eq!(LockMode::Read.max(LockMode::Write), LockMode::Write);
    }

    #[test]
    fn ref_ids_are_unique() {
        let a = RefId::next();
        let b = RefId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn isolation_level_flags() {
        assert!(!IsolationLevel::Serializable.is_write_skew_allowed());
        assert!(IsolationLevel::Snapshot.is_write_skew_allowed());
        assert!(!IsolationLevel::Snapshot.is_inconsistent_read_allowed());
        assert!(IsolationLevel::ReadCommitted.is_inconsistent_read_allowed());
    }

    #[test]
    fn lock_level_maps_to_lock_modes() {
        assert_eq!(LockLevel::None.write_lock_mode(), LockMode::None);
        assert_eq!(LockLevel::LockWrites.write_lock_mode(), LockMode::Write);
        assert_eq!(LockLevel::LockWrites.read_lock_mode(), LockMode::None);
        assert_eq!(LockLevel::LockReads.read_lock_mode(), LockMode::Read);
        assert_eq!(LockLevel::PrivatizeReads.read_lock_mode(), LockMode::Exclusive);
        assert_eq!(LockLevel::PrivatizeWrites.write_lock_mode(), LockMode::Exclusive);
    }

    #[test]
    fn status_liveness() {
        assert!(TransactionStatus::Active.is_alive());
        assert!(TransactionStatus::Prepared.is_alive());
        assert!(!TransactionStatus::Committed.is_alive());
        assert!(!TransactionStatus::Aborted.is_alive());
    }
}
