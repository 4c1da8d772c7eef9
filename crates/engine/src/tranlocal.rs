//! Transaction-local view of a reference
//!
//! A [`Tranlocal`] is created the first time a transaction opens a reference
//! and lives until the transaction commits or aborts. It records what was read
//! (the committed snapshot and its version), the working copy of a write, the
//! lock the transaction holds on the orec and whether the transaction still
//! owes the orec a departure.
//!
//! # Modes
//!
//! | Mode | Content | Published on commit |
//! |------|---------|---------------------|
//! | `Read` | committed snapshot | no |
//! | `Write` | snapshot plus working copy | if dirty |
//! | `Commuting` | pending functions only | yes, evaluated under the exclusive lock |
//! | `Constructing` | working copy of a new reference | always |

use crate::tref::{Committed, RefInner, TxnValue, Watched};
use smallvec::SmallVec;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tranquil_concurrency::{Arrival, Latch, Registration};
use tranquil_core::{LockMode, RefId, StmError, StmResult, Version};

/// Pending commuting function
pub(crate) type Commute<T> = Box<dyn FnOnce(T) -> T + Send>;

/// What the transaction did with the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranlocalMode {
    /// Opened for read
    Read,
    /// Opened for write
    Write,
    /// Only commuting functions were applied
    Commuting,
    /// Created by this transaction
    Constructing,
}

impl TranlocalMode {
    /// Whether the tranlocal may publish a value on commit
    pub fn is_write(self) -> bool {
        !matches!(self, TranlocalMode::Read)
    }
}

enum Content<T> {
    Committed(Arc<Committed<T>>),
    Working {
        base: Option<Arc<Committed<T>>>,
        value: T,
    },
    Deferred(Vec<Commute<T>>),
}

pub(crate) struct Loaded<T> {
    snapshot: Arc<Committed<T>>,
    lock_mode: LockMode,
    has_depart_obligation: bool,
}

fn invariant_violation(what: &str, id: RefId) -> StmError {
    tracing::error!(reference = %id, "{}", what);
    StmError::Panic(format!("{}: {}", what, id))
}

/// Whether taking `mode` with this grant may invalidate other readers
fn signals_conflict(mode: LockMode, arrival: Arrival) -> bool {
    mode == LockMode::Exclusive && (arrival.has_conflict() || !arrival.has_depart_obligation())
}

/// Transaction-local state of one reference
pub struct Tranlocal<T: TxnValue> {
    owner: Arc<RefInner<T>>,
    mode: TranlocalMode,
    content: Content<T>,
    version: Version,
    lock_mode: LockMode,
    has_depart_obligation: bool,
    is_dirty: bool,
    tracked: bool,
    ensured: bool,
}

impl<T: TxnValue> fmt::Debug for Tranlocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("reference", &self.owner.id)
            .field("mode", &self.mode)
            .field("version", &self.version)
            .field("lock_mode", &self.lock_mode)
            .field("has_depart_obligation", &self.has_depart_obligation)
            .field("is_dirty", &self.is_dirty)
            .field("tracked", &self.tracked)
            .finish()
    }
}

impl<T: TxnValue> Tranlocal<T> {
    /// Load the committed snapshot of `owner`
    ///
    /// With a lock mode other than `None` the lock is taken together with the
    /// arrival. Otherwise the orec is arrived at only if `arrive` is set; an
    /// unarrived read just waits for the exclusive lock to be released. Returns
    /// `None` when the orec stayed locked for the whole spin budget. Sets
    /// `conflict` when an exclusive lock was taken over other readers.
    pub(crate) fn load(
        owner: &RefInner<T>,
        lock_mode: LockMode,
        spin_count: u32,
        arrive: bool,
        conflict: &mut bool,
    ) -> StmResult<Option<Loaded<T>>> {
        if lock_mode != LockMode::None {
            let arrival = owner.orec.arrive_and_lock(spin_count, lock_mode)?;
            if !arrival.is_granted() {
                return Ok(None);
            }
            *conflict |= signals_conflict(lock_mode, arrival);
            return Ok(Some(Loaded {
                snapshot: owner.snapshot(),
                lock_mode,
                has_depart_obligation: arrival.has_depart_obligation(),
            }));
        }

        loop {
            let snapshot = owner.snapshot();
            if arrive {
                let arrival = owner.orec.arrive(spin_count)?;
                if !arrival.is_granted() {
                    return Ok(None);
                }
                if owner.version() == snapshot.version {
                    return Ok(Some(Loaded {
                        snapshot,
                        lock_mode,
                        has_depart_obligation: arrival.has_depart_obligation(),
                    }));
                }
                if arrival.has_depart_obligation() {
                    owner.orec.depart_after_failure()?;
                }
            } else {
                if !owner.orec.wait_for_exclusive_lock_to_become_free(spin_count) {
                    return Ok(None);
                }
                if owner.version() == snapshot.version {
                    return Ok(Some(Loaded {
                        snapshot,
                        lock_mode,
                        has_depart_obligation: false,
                    }));
                }
            }
        }
    }

    pub(crate) fn read(owner: Arc<RefInner<T>>, loaded: Loaded<T>, tracked: bool) -> Self {
        Tranlocal {
            owner,
            mode: TranlocalMode::Read,
            version: loaded.snapshot.version,
            content: Content::Committed(loaded.snapshot),
            lock_mode: loaded.lock_mode,
            has_depart_obligation: loaded.has_depart_obligation,
            is_dirty: false,
            tracked,
            ensured: false,
        }
    }

    pub(crate) fn commuting(owner: Arc<RefInner<T>>, function: Commute<T>) -> Self {
        Tranlocal {
            owner,
            mode: TranlocalMode::Commuting,
            content: Content::Deferred(vec![function]),
            version: 0,
            lock_mode: LockMode::None,
            has_depart_obligation: false,
            is_dirty: false,
            tracked: false,
            ensured: false,
        }
    }

    /// Tranlocal of a reference created by the transaction
    ///
    /// The orec was created arrived and exclusively locked on its behalf.
    pub(crate) fn constructing(owner: Arc<RefInner<T>>, value: T) -> Self {
        Tranlocal {
            owner,
            mode: TranlocalMode::Constructing,
            content: Content::Working { base: None, value },
            version: 0,
            lock_mode: LockMode::Exclusive,
            has_depart_obligation: true,
            is_dirty: true,
            tracked: false,
            ensured: false,
        }
    }

    /// Reference this tranlocal belongs to
    pub fn ref_id(&self) -> RefId {
        self.owner.id
    }

    /// Current mode
    pub fn mode(&self) -> TranlocalMode {
        self.mode
    }

    /// Version of the committed value this tranlocal was loaded from
    pub fn version(&self) -> Version {
        self.version
    }

    /// Lock held by the owning transaction
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Whether the last dirty check found a change
    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Value as seen by the transaction
    ///
    /// `None` while only commuting functions are pending.
    pub fn value(&self) -> Option<&T> {
        match &self.content {
            Content::Committed(committed) => Some(&committed.value),
            Content::Working { value, .. } => Some(value),
            Content::Deferred(_) => None,
        }
    }

    /// Mutable working copy, if this tranlocal was opened for write
    pub fn value_mut(&mut self) -> Option<&mut T> {
        match &mut self.content {
            Content::Working { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Replace the working copy
    ///
    /// Pending commuting functions are dropped: the write overrides them.
    pub fn set_value(&mut self, value: T) {
        match &mut self.content {
            Content::Working { value: slot, .. } => *slot = value,
            Content::Committed(committed) => {
                let base = Some(Arc::clone(committed));
                self.content = Content::Working { base, value };
                self.mode = TranlocalMode::Write;
                self.tracked = true;
            }
            Content::Deferred(_) => {
                self.content = Content::Working { base: None, value };
                self.mode = TranlocalMode::Write;
            }
        }
    }

    pub(crate) fn current_value(&self) -> StmResult<&T> {
        self.value()
            .ok_or_else(|| invariant_violation("commuting tranlocal read without evaluation", self.owner.id))
    }

    pub(crate) fn owner(&self) -> &Arc<RefInner<T>> {
        &self.owner
    }

    pub(crate) fn mark_ensured(&mut self) {
        self.ensured = true;
    }

    pub(crate) fn upgrade_to_write(&mut self) {
        if let Content::Committed(committed) = &self.content {
            let value = committed.value.clone();
            let base = Some(Arc::clone(committed));
            self.content = Content::Working { base, value };
            self.mode = TranlocalMode::Write;
            self.tracked = true;
        }
    }

    /// Queue `function`, or apply it right away to a materialized value
    pub(crate) fn push_commute(&mut self, function: Commute<T>) {
        match &mut self.content {
            Content::Deferred(pending) => pending.push(function),
            Content::Working { value, .. } => {
                let current = value.clone();
                *value = function(current);
            }
            Content::Committed(_) => {
                self.upgrade_to_write();
                self.push_commute(function);
            }
        }
    }

    /// Evaluate pending commuting functions against a freshly loaded value
    ///
    /// Returns false if the load failed. The tranlocal becomes a write.
    pub(crate) fn materialize(
        &mut self,
        lock_mode: LockMode,
        spin_count: u32,
        arrive: bool,
        conflict: &mut bool,
    ) -> StmResult<bool> {
        if self.mode != TranlocalMode::Commuting {
            return Ok(true);
        }
        let loaded = match Self::load(&self.owner, lock_mode, spin_count, arrive, conflict)? {
            Some(loaded) => loaded,
            None => return Ok(false),
        };
        self.apply_pending(loaded);
        Ok(true)
    }

    fn apply_pending(&mut self, loaded: Loaded<T>) {
        let pending = match std::mem::replace(&mut self.content, Content::Deferred(Vec::new())) {
            Content::Deferred(pending) => pending,
            other => {
                self.content = other;
                return;
            }
        };
        let value = pending
            .into_iter()
            .fold(loaded.snapshot.value.clone(), |value, function| function(value));
        self.version = loaded.snapshot.version;
        self.content = Content::Working {
            base: Some(loaded.snapshot),
            value,
        };
        self.mode = TranlocalMode::Write;
        self.lock_mode = loaded.lock_mode;
        self.has_depart_obligation = loaded.has_depart_obligation;
        self.tracked = true;
    }

    /// Make sure the transaction holds at least `desired` on the orec
    ///
    /// A freshly taken lock is followed by a check that the reference did not
    /// change since it was read. Returns false if the lock could not be taken
    /// or the reference changed; a lock taken before the check fails stays
    /// recorded so the abort releases it.
    pub(crate) fn try_lock_and_check_conflict(
        &mut self,
        spin_count: u32,
        desired: LockMode,
        conflict: &mut bool,
    ) -> StmResult<bool> {
        if self.lock_mode >= desired {
            return Ok(true);
        }

        let orec = &self.owner.orec;
        let arrival = match self.lock_mode {
            LockMode::Read => orec.upgrade_read_lock(spin_count, desired == LockMode::Exclusive)?,
            LockMode::Write => orec.upgrade_write_lock_to_exclusive()?,
            _ if self.has_depart_obligation => orec.lock_after_arrive(spin_count, desired)?,
            _ => orec.arrive_and_lock(spin_count, desired)?,
        };
        if !arrival.is_granted() {
            return Ok(false);
        }

        let previous = self.lock_mode;
        self.lock_mode = desired;
        if previous == LockMode::None {
            self.has_depart_obligation = arrival.has_depart_obligation();
        }
        *conflict |= signals_conflict(desired, arrival);

        if previous != LockMode::None || self.mode == TranlocalMode::Constructing {
            return Ok(true);
        }
        Ok(self.owner.version() == self.version)
    }
}

/// Type-erased tranlocal as stored in a transaction
pub(crate) trait AnyTranlocal: Send {
    fn ref_id(&self) -> RefId;
    fn mode(&self) -> TranlocalMode;
    fn lock_mode(&self) -> LockMode;
    fn is_tracked(&self) -> bool;
    fn is_ensured(&self) -> bool;
    fn is_dirty(&self) -> bool;

    /// Recompute the dirty flag; returns it
    fn update_dirty(&mut self, dirty_check: bool) -> bool;

    /// Whether the value read is no longer the committed one
    fn has_read_conflict(&self) -> bool;

    /// Lock a write exclusively, evaluating commuting functions
    fn prepare_write(&mut self, spin_count: u32, conflict: &mut bool) -> StmResult<bool>;

    /// Read-lock a read so it cannot change before the commit completes
    fn prepare_read(&mut self, spin_count: u32, conflict: &mut bool) -> StmResult<bool>;

    /// Install the working copy as the new committed value and release the orec
    fn publish(&mut self, version: Version, latches: &mut SmallVec<[Arc<Latch>; 4]>) -> StmResult<()>;

    fn release_after_reading(&mut self) -> StmResult<()>;
    fn release_after_failure(&mut self) -> StmResult<()>;

    /// Queue `latch` for the next change of the version read
    fn register_listener(&self, latch: &Arc<Latch>) -> Option<Registration>;

    /// Handle for removing a latch queued by `register_listener`
    fn watched(&self) -> Arc<dyn Watched>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: TxnValue> AnyTranlocal for Tranlocal<T> {
    fn ref_id(&self) -> RefId {
        self.owner.id
    }

    fn mode(&self) -> TranlocalMode {
        self.mode
    }

    fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    fn is_tracked(&self) -> bool {
        self.tracked
    }

    fn is_ensured(&self) -> bool {
        self.ensured
    }

    fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    fn update_dirty(&mut self, dirty_check: bool) -> bool {
        self.is_dirty = match (&self.mode, &self.content) {
            (TranlocalMode::Read, _) => false,
            (TranlocalMode::Constructing, _) | (TranlocalMode::Commuting, _) => true,
            (TranlocalMode::Write, Content::Working { base: Some(base), value }) => {
                !dirty_check || *value != base.value
            }
            (TranlocalMode::Write, _) => true,
        };
        self.is_dirty
    }

    fn has_read_conflict(&self) -> bool {
        match self.mode {
            TranlocalMode::Commuting | TranlocalMode::Constructing => false,
            _ if self.lock_mode != LockMode::None => false,
            _ => self.owner.orec.has_exclusive_lock() || self.owner.version() != self.version,
        }
    }

    fn prepare_write(&mut self, spin_count: u32, conflict: &mut bool) -> StmResult<bool> {
        match self.mode {
            TranlocalMode::Constructing => Ok(true),
            TranlocalMode::Commuting => {
                let loaded = match Self::load(&self.owner, LockMode::Exclusive, spin_count, true, conflict)? {
                    Some(loaded) => loaded,
                    None => return Ok(false),
                };
                self.apply_pending(loaded);
                Ok(true)
            }
            _ => self.try_lock_and_check_conflict(spin_count, LockMode::Exclusive, conflict),
        }
    }

    fn prepare_read(&mut self, spin_count: u32, conflict: &mut bool) -> StmResult<bool> {
        match self.mode {
            TranlocalMode::Commuting | TranlocalMode::Constructing => Ok(true),
            _ => self.try_lock_and_check_conflict(spin_count, LockMode::Read, conflict),
        }
    }

    fn publish(&mut self, version: Version, latches: &mut SmallVec<[Arc<Latch>; 4]>) -> StmResult<()> {
        if self.lock_mode != LockMode::Exclusive {
            return Err(invariant_violation("publish without the exclusive lock", self.owner.id));
        }
        let value = match std::mem::replace(&mut self.content, Content::Deferred(Vec::new())) {
            Content::Working { value, .. } => value,
            other => {
                self.content = other;
                return Err(invariant_violation("publish without a working value", self.owner.id));
            }
        };
        self.owner.publish(version, value);
        self.owner.orec.depart_after_update_and_unlock()?;
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
        latches.extend(self.owner.listeners.take_all());
        Ok(())
    }

    fn release_after_reading(&mut self) -> StmResult<()> {
        let orec = &self.owner.orec;
        match (self.lock_mode, self.has_depart_obligation) {
            (LockMode::None, true) => orec.depart_after_reading()?,
            (LockMode::None, false) => {}
            (_, true) => orec.depart_after_reading_and_unlock()?,
            (_, false) => orec.unlock_by_unregistered()?,
        }
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
        Ok(())
    }

    fn release_after_failure(&mut self) -> StmResult<()> {
        // an aborted construction is never made visible
        if self.mode == TranlocalMode::Constructing {
            return Ok(());
        }
        let orec = &self.owner.orec;
        match (self.lock_mode, self.has_depart_obligation) {
            (LockMode::None, true) => orec.depart_after_failure()?,
            (LockMode::None, false) => {}
            (_, true) => orec.depart_after_failure_and_unlock()?,
            (_, false) => orec.unlock_by_unregistered()?,
        }
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
        Ok(())
    }

    fn register_listener(&self, latch: &Arc<Latch>) -> Option<Registration> {
        if !self.tracked || !matches!(self.mode, TranlocalMode::Read | TranlocalMode::Write) {
            return None;
        }
        Some(
            self.owner
                .listeners
                .register(latch, self.version + 1, self.owner.version_cell()),
        )
    }

    fn watched(&self) -> Arc<dyn Watched> {
        Arc::clone(&self.owner) as Arc<dyn Watched>
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
