//! Transactional references
//!
//! A [`Ref`] owns an [`Orec`], the latest committed snapshot of its value and
//! the registry of transactions blocked on it. Committed snapshots are never
//! mutated: a commit swaps in a fresh `Arc<Committed<T>>` while holding the
//! exclusive lock, then publishes the new version. The snapshot pointer is an
//! epoch-managed atomic, so loading it never blocks; a replaced snapshot is
//! freed once no pinned reader can still see it.
//!
//! Two families of operations are offered:
//! - transactional helpers (`get`, `set`, `alter`, `commute`, ...) taking a
//!   `&mut Transaction`
//! - atomic operations (`atomic_get`, `atomic_set`, ...) running outside any
//!   transaction; updates lock the orec exclusively, tick the clock and wake
//!   listeners exactly like a commit

use crate::backoff::{BackoffPolicy, ExponentialBackoffPolicy};
use crate::stm::Stm;
use crate::transaction::Transaction;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tranquil_concurrency::{Latch, ListenerRegistry, Orec};
use tranquil_core::{LockMode, RefId, StmError, StmResult, Version};

/// Lock attempts made by an atomic update before reporting `Locked`
pub const ATOMIC_LOCK_ATTEMPTS: usize = 16;

/// Values that can live in a [`Ref`]
///
/// Equality drives the dirty check: a write equal to the value read is not
/// published.
pub trait TxnValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> TxnValue for T {}

/// Immutable committed snapshot
pub(crate) struct Committed<T> {
    pub(crate) version: Version,
    pub(crate) value: T,
}

pub(crate) struct RefInner<T> {
    pub(crate) id: RefId,
    pub(crate) stm: Stm,
    pub(crate) orec: Orec,
    pub(crate) listeners: ListenerRegistry,
    version: AtomicU64,
    committed: Atomic<Arc<Committed<T>>>,
}

impl<T: TxnValue> RefInner<T> {
    fn new(stm: Stm, orec: Orec, value: T) -> Self {
        RefInner {
            id: RefId::next(),
            stm,
            orec,
            listeners: ListenerRegistry::new(),
            version: AtomicU64::new(0),
            committed: Atomic::new(Arc::new(Committed { version: 0, value })),
        }
    }

    /// Latest committed snapshot
    ///
    /// Only consistent with [`RefInner::version`] while no exclusive lock is held.
    pub(crate) fn snapshot(&self) -> Arc<Committed<T>> {
        let guard = epoch::pin();
        let current = self.committed.load(Ordering::Acquire, &guard);
        // SAFETY: the pointer is never null and is only retired through
        // `defer_destroy`, which waits for this guard.
        Arc::clone(unsafe { current.deref() })
    }

    pub(crate) fn version(&self) -> Version {
        self.version.load(Ordering::SeqCst)
    }

    pub(crate) fn version_cell(&self) -> &AtomicU64 {
        &self.version
    }

    /// Install a new committed value; the caller holds the exclusive lock
    pub(crate) fn publish(&self, version: Version, value: T) {
        let guard = epoch::pin();
        let replaced = self.committed.swap(
            Owned::new(Arc::new(Committed { version, value })),
            Ordering::AcqRel,
            &guard,
        );
        // SAFETY: `replaced` is unlinked; readers still holding it are pinned.
        unsafe { guard.defer_destroy(replaced) };
        self.version.store(version, Ordering::SeqCst);
    }
}

/// Listener registry of a reference, independent of its value type
pub(crate) trait Watched: Send + Sync {
    /// Drop `latch` from the registry; true if it was still queued
    fn deregister(&self, latch: &Arc<Latch>) -> bool;
}

impl<T: TxnValue> Watched for RefInner<T> {
    fn deregister(&self, latch: &Arc<Latch>) -> bool {
        self.listeners.deregister(latch, &self.version)
    }
}

impl<T> Drop for RefInner<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent readers.
        unsafe {
            let guard = epoch::unprotected();
            let current = self.committed.load(Ordering::Relaxed, guard);
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

/// Transactional reference
pub struct Ref<T: TxnValue> {
    inner: Arc<RefInner<T>>,
}

impl<T: TxnValue> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TxnValue> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T: TxnValue> Eq for Ref<T> {}

impl<T: TxnValue> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version())
            .field("orec", &self.inner.orec.state())
            .finish()
    }
}

impl<T: TxnValue> Ref<T> {
    pub(crate) fn new(stm: Stm, value: T) -> Self {
        let orec = Orec::new(stm.config().read_biased_threshold);
        Ref {
            inner: Arc::new(RefInner::new(stm, orec, value)),
        }
    }

    /// Reference created inside a transaction, exclusively locked by its creator
    pub(crate) fn constructed(stm: Stm, value: T) -> Self {
        let orec = Orec::new_exclusively_locked(stm.config().read_biased_threshold);
        Ref {
            inner: Arc::new(RefInner::new(stm, orec, value)),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RefInner<T>> {
        &self.inner
    }

    /// Identity of this reference
    pub fn id(&self) -> RefId {
        self.inner.id
    }

    /// Runtime this reference belongs to
    pub fn stm(&self) -> &Stm {
        &self.inner.stm
    }

    // ------------------------------------------------------------------------
    // Transactional operations
    // ------------------------------------------------------------------------

    /// Read the value as seen by `tx`
    pub fn get(&self, tx: &mut Transaction) -> StmResult<T> {
        tx.open_for_read(self, LockMode::None)?
            .current_value()
            .cloned()
    }

    /// Replace the value in `tx`
    pub fn set(&self, tx: &mut Transaction, value: T) -> StmResult<()> {
        tx.open_for_write(self, LockMode::None)?.set_value(value);
        Ok(())
    }

    /// Replace the value in `tx`, returning the previous one
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let previous = tranlocal.current_value()?.clone();
        tranlocal.set_value(value);
        Ok(previous)
    }

    /// Apply `f` to the value in `tx`
    pub fn alter<F>(&self, tx: &mut Transaction, f: F) -> StmResult<()>
    where
        F: FnOnce(&T) -> T,
    {
        self.alter_and_get(tx, f).map(|_| ())
    }

    /// Apply `f` to the value in `tx`, returning the new value
    pub fn alter_and_get<F>(&self, tx: &mut Transaction, f: F) -> StmResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let next = f(tranlocal.current_value()?);
        tranlocal.set_value(next.clone());
        Ok(next)
    }

    /// Apply `f` to the value in `tx`, returning the old value
    pub fn get_and_alter<F>(&self, tx: &mut Transaction, f: F) -> StmResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let previous = tranlocal.current_value()?.clone();
        tranlocal.set_value(f(&previous));
        Ok(previous)
    }

    /// Defer `f` until commit
    ///
    /// Two transactions commuting on the same reference do not conflict with
    /// each other. Reading the reference afterwards in the same transaction
    /// evaluates the pending functions and turns the commute into a plain write.
    pub fn commute<F>(&self, tx: &mut Transaction, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        tx.commute(self, f)
    }

    /// Read the reference and keep it unchanged until `tx` commits
    ///
    /// Prevents write skew on this reference under isolation levels that
    /// otherwise allow it.
    pub fn ensure(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.ensure(self)
    }

    /// Open the reference in `tx` holding at least `mode`
    pub fn acquire(&self, tx: &mut Transaction, mode: LockMode) -> StmResult<()> {
        tx.open_for_read(self, mode).map(|_| ())
    }

    /// Lock held on this reference by `tx`
    pub fn lock_mode(&self, tx: &Transaction) -> StmResult<LockMode> {
        tx.lock_mode_of(self)
    }

    /// Block `tx` until `predicate` holds for the value
    ///
    /// Returns the retry signal when it does not; the executor re-runs the
    /// body once one of the references read so far changes.
    pub fn await_value<P>(&self, tx: &mut Transaction, predicate: P) -> StmResult<()>
    where
        P: FnOnce(&T) -> bool,
    {
        let satisfied = predicate(tx.open_for_read(self, LockMode::None)?.current_value()?);
        if satisfied {
            Ok(())
        } else {
            tx.retry()
        }
    }

    // ------------------------------------------------------------------------
    // Atomic operations
    // ------------------------------------------------------------------------

    /// Read the committed value outside any transaction
    ///
    /// # Errors
    /// Returns `Locked` if the reference stays exclusively locked for the whole
    /// spin budget.
    pub fn atomic_get(&self) -> StmResult<T> {
        let spin_count = self.inner.stm.config().spin_count;
        loop {
            let snapshot = self.inner.snapshot();
            if !self.inner.orec.wait_for_exclusive_lock_to_become_free(spin_count) {
                return Err(StmError::Locked(format!("{} is exclusively locked", self.inner.id)));
            }
            if self.inner.version() == snapshot.version {
                return Ok(snapshot.value.clone());
            }
        }
    }

    /// Read the latest committed value without checking for locks
    pub fn atomic_weak_get(&self) -> T {
        self.inner.snapshot().value.clone()
    }

    /// Replace the committed value outside any transaction
    pub fn atomic_set(&self, value: T) -> StmResult<()> {
        self.atomic_update(|_| (Some(value), ()))
    }

    /// Replace the committed value, returning the previous one
    pub fn atomic_get_and_set(&self, value: T) -> StmResult<T> {
        self.atomic_update(|current| (Some(value), current.clone()))
    }

    /// Replace the committed value if it equals `expected`
    pub fn atomic_compare_and_set(&self, expected: &T, value: T) -> StmResult<bool> {
        self.atomic_update(|current| {
            if current == expected {
                (Some(value), true)
            } else {
                (None, false)
            }
        })
    }

    /// Apply `f` to the committed value, returning the new value
    pub fn atomic_alter<F>(&self, f: F) -> StmResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        self.atomic_update(|current| {
            let next = f(current);
            (Some(next.clone()), next)
        })
    }

    /// Strongest lock currently held on the reference by anyone
    pub fn atomic_lock_mode(&self) -> LockMode {
        self.inner.orec.lock_mode()
    }

    /// Whether readers stopped registering with the orec
    pub fn is_read_biased(&self) -> bool {
        self.inner.orec.state().is_read_biased()
    }

    /// Version of the latest committed value
    pub fn atomic_version(&self) -> Version {
        self.inner.version()
    }

    fn atomic_update<R, F>(&self, update: F) -> StmResult<R>
    where
        F: FnOnce(&T) -> (Option<T>, R),
    {
        let inner = &self.inner;
        let stm = &inner.stm;
        let spin_count = stm.config().spin_count;
        let backoff = ExponentialBackoffPolicy::default();

        let mut attempt = 0;
        let arrival = loop {
            attempt += 1;
            let arrival = inner.orec.arrive_and_lock(spin_count, LockMode::Exclusive)?;
            if arrival.is_granted() {
                break arrival;
            }
            if attempt >= ATOMIC_LOCK_ATTEMPTS {
                return Err(StmError::Locked(format!(
                    "{} could not be locked after {} attempts",
                    inner.id, attempt
                )));
            }
            backoff.delay(attempt);
        };

        let current = inner.snapshot();
        let (next, result) = update(&current.value);

        match next {
            Some(value) if value != current.value => {
                if arrival.has_conflict() || !arrival.has_depart_obligation() {
                    stm.conflict_counter().signal_conflict();
                }
                let version = stm.clock().tick();
                inner.publish(version, value);
                inner.orec.depart_after_update_and_unlock()?;
                inner.listeners.open_all();
            }
            _ => {
                if arrival.has_depart_obligation() {
                    inner.orec.depart_after_failure_and_unlock()?;
                } else {
                    inner.orec.unlock_by_unregistered()?;
                }
            }
        }
        Ok(result)
    }
}
