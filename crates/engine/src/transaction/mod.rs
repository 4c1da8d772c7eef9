//! Transaction state machine
//!
//! A [`Transaction`] coordinates the tranlocals of the references it opened.
//!
//! ```text
//! Active ──prepare──> Prepared ──commit──> Committed
//!   │                    │
//!   └──────abort─────────┴──────────────> Aborted
//! ```
//!
//! ## Commit sequence
//!
//! 1. compute the dirty flag of every write
//! 2. lock every dirty write exclusively and check it did not change since read
//! 3. read-lock tracked reads (serializable) and ensured references
//! 4. signal the conflict counter if an exclusive lock was taken over readers
//! 5. tick the version clock
//! 6. publish the dirty writes and release every orec
//! 7. open the latches of transactions blocked on the written references
//!
//! A failing lock in step 2 or 3 aborts the transaction, releasing everything
//! acquired so far. There is no global lock ordering: the loser aborts and
//! retries instead of waiting.
//!
//! ## Read consistency
//!
//! Each new read is followed by a conflict scan over the tracked tranlocals:
//! - poor man's scan: nothing is arrived at; the scan runs whenever the version
//!   clock moved since the last one, and is bounded by
//!   [`MAX_POOR_MANS_CONFLICT_SCAN_LENGTH`] tranlocals
//! - rich man's scan: reads arrive at their orec; writers locking over arrived
//!   readers bump the [`GlobalConflictCounter`](tranquil_concurrency::GlobalConflictCounter)
//!   and the scan only runs when it moved
//!
//! Every failure path aborts the transaction before the error is returned.

mod attachments;

pub use attachments::AttachmentStrategy;

use crate::config::{TransactionConfig, MAX_POOR_MANS_CONFLICT_SCAN_LENGTH};
use crate::factory::SpeculativeConfiguration;
use crate::stm::Stm;
use crate::tranlocal::{AnyTranlocal, Tranlocal, TranlocalMode};
use crate::tref::{Ref, TxnValue, Watched};
use attachments::{Attachments, Slot};
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tranquil_concurrency::{AwaitOutcome, Interrupter, Latch, Registration};
use tranquil_core::{
    ControlFlow, IsolationLevel, LockMode, RefId, SpeculativeFailure, StmError, StmResult,
    TransactionStatus, Version,
};

/// A transaction
///
/// Owned and driven by a single thread. Dropping a live transaction aborts it.
pub struct Transaction {
    stm: Stm,
    config: Arc<TransactionConfig>,
    speculative: Arc<RwLock<SpeculativeConfiguration>>,
    status: TransactionStatus,
    attachments: Attachments,
    rich_mans_conflict_scan: bool,
    read_version: Version,
    local_conflict_count: u64,
    commit_conflict: bool,
    has_writes: bool,
    abort_only: bool,
    attempt: usize,
    remaining_timeout: Option<Duration>,
    interrupter: Option<Arc<Interrupter>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("family", &self.config.family_name)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("strategy", &self.attachments.strategy())
            .field("size", &self.attachments.len())
            .field("read_version", &self.read_version)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        stm: Stm,
        config: Arc<TransactionConfig>,
        speculative: Arc<RwLock<SpeculativeConfiguration>>,
    ) -> Self {
        let current = *speculative.read();
        let remaining_timeout = config.timeout;
        Transaction {
            read_version: stm.clock().current(),
            local_conflict_count: stm.conflict_counter().count(),
            stm,
            config,
            speculative,
            status: TransactionStatus::Active,
            attachments: Attachments::new(current.attachment_strategy()),
            rich_mans_conflict_scan: current.is_rich_mans_conflict_scan_required(),
            commit_conflict: false,
            has_writes: false,
            abort_only: false,
            attempt: 1,
            remaining_timeout,
            interrupter: None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Whether the transaction is active or prepared
    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    /// Configuration shared with the other transactions of the factory
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Runtime the transaction belongs to
    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    /// Attempt number, starting at 1
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Blocking time left for retries
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// Clock value the poor man's conflict scan last validated against
    pub fn read_version(&self) -> Version {
        self.read_version
    }

    /// Number of references opened
    pub fn size(&self) -> usize {
        self.attachments.len()
    }

    /// How the opened references are stored
    pub fn attachment_strategy(&self) -> AttachmentStrategy {
        self.attachments.strategy()
    }

    /// Whether reads arrive at their orec
    pub fn is_rich_mans_conflict_scan(&self) -> bool {
        self.rich_mans_conflict_scan
    }

    /// Make any later commit fail with `AbortOnly`
    pub fn set_abort_only(&mut self) -> StmResult<()> {
        if let Err(error) = self.check_active() {
            return self.fail(error);
        }
        self.abort_only = true;
        Ok(())
    }

    /// Whether the transaction was marked abort-only
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// Handle another thread may use to interrupt a blocking retry
    pub fn set_interrupter(&mut self, interrupter: Arc<Interrupter>) {
        self.interrupter = Some(interrupter);
    }

    /// Lock this transaction holds on `r`
    pub fn lock_mode_of<T: TxnValue>(&self, r: &Ref<T>) -> StmResult<LockMode> {
        if !self.is_alive() {
            return Err(self.dead_error());
        }
        Ok(self
            .attachments
            .locate(r.id())
            .map_or(LockMode::None, |slot| slot.lock_mode()))
    }

    // ------------------------------------------------------------------------
    // Opening references
    // ------------------------------------------------------------------------

    /// Open `r` for read, holding at least `lock_mode`
    ///
    /// Opening a reference twice returns the same tranlocal; a stronger lock
    /// mode upgrades the lock held.
    ///
    /// # Errors
    /// - `ControlFlow(ReadWriteConflict)` if the lock could not be taken
    /// - `ControlFlow(ReadConflict)` if the read set is no longer consistent
    /// - `ControlFlow(SpeculativeConfiguration)` if the transaction is too small
    /// - `DeadTransaction`, `PreparedTransaction`, `StmMismatch` on misuse
    pub fn open_for_read<T: TxnValue>(
        &mut self,
        r: &Ref<T>,
        lock_mode: LockMode,
    ) -> StmResult<&Tranlocal<T>> {
        if let Err(error) = self.open_for_read_inner(r, lock_mode) {
            return self.fail(error);
        }
        match self
            .attachments
            .locate(r.id())
            .and_then(|slot| slot.as_any().downcast_ref::<Tranlocal<T>>())
        {
            Some(tranlocal) => Ok(tranlocal),
            None => Err(lookup_failure(r.id())),
        }
    }

    /// Open `r` for write, holding at least `lock_mode`
    ///
    /// # Errors
    /// As [`Transaction::open_for_read`], plus `Readonly` for a readonly
    /// transaction.
    pub fn open_for_write<T: TxnValue>(
        &mut self,
        r: &Ref<T>,
        lock_mode: LockMode,
    ) -> StmResult<&mut Tranlocal<T>> {
        if let Err(error) = self.open_for_write_inner(r, lock_mode) {
            return self.fail(error);
        }
        match self
            .attachments
            .locate_mut(r.id())
            .and_then(|slot| slot.as_any_mut().downcast_mut::<Tranlocal<T>>())
        {
            Some(tranlocal) => Ok(tranlocal),
            None => Err(lookup_failure(r.id())),
        }
    }

    /// Create a reference only this transaction can see until it commits
    ///
    /// If the transaction aborts the reference stays locked and unusable.
    pub fn open_for_construction<T: TxnValue>(&mut self, initial: T) -> StmResult<Ref<T>> {
        match self.open_for_construction_inner(initial) {
            Ok(r) => Ok(r),
            Err(error) => self.fail(error),
        }
    }

    /// Defer `function` on `r` until commit
    pub fn commute<T, F>(&mut self, r: &Ref<T>, function: F) -> StmResult<()>
    where
        T: TxnValue,
        F: FnOnce(T) -> T + Send + 'static,
    {
        match self.commute_inner(r, Box::new(function)) {
            Ok(()) => Ok(()),
            Err(error) => self.fail(error),
        }
    }

    /// Read `r` and keep it unchanged until commit
    pub fn ensure<T: TxnValue>(&mut self, r: &Ref<T>) -> StmResult<()> {
        if let Err(error) = self.open_for_read_inner(r, LockMode::None) {
            return self.fail(error);
        }
        match self
            .attachments
            .locate_mut(r.id())
            .and_then(|slot| slot.as_any_mut().downcast_mut::<Tranlocal<T>>())
        {
            Some(tranlocal) => {
                tranlocal.mark_ensured();
                Ok(())
            }
            None => Err(lookup_failure(r.id())),
        }
    }

    fn open_for_read_inner<T: TxnValue>(&mut self, r: &Ref<T>, lock_mode: LockMode) -> StmResult<()> {
        self.check_active()?;
        self.check_stm(r)?;

        let desired = lock_mode.max(self.config.effective_read_lock_mode());
        let spin_count = self.config.spin_count;
        let arrive = self.rich_mans_conflict_scan;
        let mut conflict = false;

        if let Some(tranlocal) = self.locate_mut::<T>(r.id())? {
            let was_commuting = tranlocal.mode() == TranlocalMode::Commuting;
            let materialized = tranlocal.materialize(desired, spin_count, arrive, &mut conflict)?;
            let locked = materialized && tranlocal.try_lock_and_check_conflict(spin_count, desired, &mut conflict)?;
            self.commit_conflict |= conflict;
            if !locked {
                return Err(ControlFlow::ReadWriteConflict.into());
            }
            if was_commuting && !self.is_read_consistent() {
                return Err(ControlFlow::ReadConflict.into());
            }
            return Ok(());
        }

        self.check_room()?;
        let tracked = self.config.track_reads || desired != LockMode::None;
        let loaded = Tranlocal::load(r.inner(), desired, spin_count, arrive && tracked, &mut conflict)?;
        self.commit_conflict |= conflict;
        let loaded = loaded.ok_or(StmError::ControlFlow(ControlFlow::ReadWriteConflict))?;

        self.attach(Box::new(Tranlocal::read(Arc::clone(r.inner()), loaded, tracked)))?;
        if !self.is_read_consistent() {
            return Err(ControlFlow::ReadConflict.into());
        }
        Ok(())
    }

    fn open_for_write_inner<T: TxnValue>(&mut self, r: &Ref<T>, lock_mode: LockMode) -> StmResult<()> {
        self.check_active()?;
        self.check_stm(r)?;
        self.check_writable()?;

        let desired = lock_mode.max(self.config.effective_write_lock_mode());
        let spin_count = self.config.spin_count;
        let arrive = self.rich_mans_conflict_scan;
        let mut conflict = false;

        if let Some(tranlocal) = self.locate_mut::<T>(r.id())? {
            let materialized = tranlocal.materialize(desired, spin_count, arrive, &mut conflict)?;
            tranlocal.upgrade_to_write();
            let locked = materialized && tranlocal.try_lock_and_check_conflict(spin_count, desired, &mut conflict)?;
            self.commit_conflict |= conflict;
            self.has_writes = true;
            if !locked {
                return Err(ControlFlow::ReadWriteConflict.into());
            }
            return Ok(());
        }

        self.check_room()?;
        let loaded = Tranlocal::load(r.inner(), desired, spin_count, arrive, &mut conflict)?;
        self.commit_conflict |= conflict;
        let loaded = loaded.ok_or(StmError::ControlFlow(ControlFlow::ReadWriteConflict))?;

        let mut tranlocal = Tranlocal::read(Arc::clone(r.inner()), loaded, true);
        tranlocal.upgrade_to_write();
        self.attach(Box::new(tranlocal))?;
        self.has_writes = true;
        if !self.is_read_consistent() {
            return Err(ControlFlow::ReadConflict.into());
        }
        Ok(())
    }

    fn open_for_construction_inner<T: TxnValue>(&mut self, initial: T) -> StmResult<Ref<T>> {
        self.check_active()?;
        self.check_writable()?;
        self.check_room()?;

        let r = Ref::constructed(self.stm.clone(), initial.clone());
        self.attach(Box::new(Tranlocal::constructing(Arc::clone(r.inner()), initial)))?;
        self.has_writes = true;
        Ok(r)
    }

    fn commute_inner<T: TxnValue>(&mut self, r: &Ref<T>, function: Box<dyn FnOnce(T) -> T + Send>) -> StmResult<()> {
        self.check_active()?;
        self.check_stm(r)?;
        self.check_writable()?;

        if let Some(tranlocal) = self.locate_mut::<T>(r.id())? {
            if tranlocal.mode() == TranlocalMode::Read {
                self.open_for_write_inner(r, LockMode::None)?;
                if let Some(tranlocal) = self.locate_mut::<T>(r.id())? {
                    tranlocal.push_commute(function);
                }
            } else {
                tranlocal.push_commute(function);
            }
            self.has_writes = true;
            return Ok(());
        }

        self.check_room()?;
        self.attach(Box::new(Tranlocal::commuting(Arc::clone(r.inner()), function)))?;
        self.has_writes = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Commit protocol
    // ------------------------------------------------------------------------

    /// Lock everything the commit needs
    ///
    /// Preparing a prepared transaction is a no-op.
    ///
    /// # Errors
    /// `ControlFlow(ReadWriteConflict)` or `ControlFlow(WriteConflict)` if a
    /// lock cannot be taken or a reference changed; `AbortOnly` if the
    /// transaction was marked abort-only.
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.prepare_inner() {
            Ok(()) => Ok(()),
            Err(error) => self.fail(error),
        }
    }

    fn prepare_inner(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => {}
            TransactionStatus::Prepared => return Ok(()),
            _ => return Err(self.dead_error()),
        }
        if self.abort_only {
            return Err(StmError::AbortOnly(self.config.family_name.clone()));
        }

        if self.has_writes {
            let spin_count = self.config.spin_count;
            let dirty_check = self.config.dirty_check;
            let serializable = self.config.isolation_level == IsolationLevel::Serializable;
            let mut conflict = false;

            for tranlocal in self.attachments.iter_mut() {
                if tranlocal.mode() == TranlocalMode::Commuting
                    && !tranlocal.prepare_write(spin_count, &mut conflict)?
                {
                    self.commit_conflict |= conflict;
                    return Err(ControlFlow::WriteConflict.into());
                }
            }

            let mut any_dirty = false;
            for tranlocal in self.attachments.iter_mut() {
                any_dirty |= tranlocal.update_dirty(dirty_check);
            }

            if any_dirty {
                for tranlocal in self.attachments.iter_mut() {
                    let locked = if tranlocal.is_dirty() {
                        tranlocal.prepare_write(spin_count, &mut conflict)?
                    } else if (serializable && tranlocal.is_tracked()) || tranlocal.is_ensured() {
                        tranlocal.prepare_read(spin_count, &mut conflict)?
                    } else {
                        true
                    };
                    if !locked {
                        self.commit_conflict |= conflict;
                        return Err(ControlFlow::ReadWriteConflict.into());
                    }
                }
            }
            self.commit_conflict |= conflict;
        }

        self.status = TransactionStatus::Prepared;
        Ok(())
    }

    /// Commit the transaction
    ///
    /// Committing a committed transaction is a no-op.
    ///
    /// # Errors
    /// As [`Transaction::prepare`]; `DeadTransaction` if already aborted.
    pub fn commit(&mut self) -> StmResult<()> {
        match self.commit_inner() {
            Ok(()) => Ok(()),
            Err(error) => self.fail(error),
        }
    }

    fn commit_inner(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Committed => return Ok(()),
            TransactionStatus::Aborted => return Err(self.dead_error()),
            _ => {}
        }
        self.prepare_inner()?;

        let any_dirty = self.attachments.iter().any(|tranlocal| tranlocal.is_dirty());
        let mut latches: SmallVec<[Arc<Latch>; 4]> = SmallVec::new();

        if any_dirty {
            if self.commit_conflict {
                self.stm.conflict_counter().signal_conflict();
            }
            let version = self.stm.clock().tick();
            for tranlocal in self.attachments.iter_mut() {
                if tranlocal.is_dirty() {
                    tranlocal.publish(version, &mut latches)?;
                } else {
                    tranlocal.release_after_reading()?;
                }
            }
        } else {
            for tranlocal in self.attachments.iter_mut() {
                tranlocal.release_after_reading()?;
            }
        }

        self.attachments.clear();
        self.status = TransactionStatus::Committed;

        for latch in latches {
            latch.open();
        }
        Ok(())
    }

    /// Abort the transaction, releasing every lock and arrival
    ///
    /// Aborting an aborted transaction is a no-op.
    ///
    /// # Errors
    /// `DeadTransaction` if the transaction already committed.
    pub fn abort(&mut self) -> StmResult<()> {
        self.abort_inner()
    }

    fn abort_inner(&mut self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Aborted => return Ok(()),
            TransactionStatus::Committed => return Err(self.dead_error()),
            _ => {}
        }

        let mut first_error = None;
        for tranlocal in self.attachments.iter_mut() {
            if let Err(error) = tranlocal.release_after_failure() {
                first_error.get_or_insert(error);
            }
        }
        self.attachments.clear();
        self.status = TransactionStatus::Aborted;
        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------------
    // Blocking retry
    // ------------------------------------------------------------------------

    /// Signal that the transaction can't make progress until something it
    /// read changes
    ///
    /// Always returns an error: `ControlFlow(Retry)` for the executor to act
    /// on, or `NoBlockingRetryAllowed` / `RetryNotPossible`.
    pub fn retry<R>(&mut self) -> StmResult<R> {
        if let Err(error) = self.check_active() {
            return self.fail(error);
        }
        if !self.config.blocking_allowed {
            let family = self.config.family_name.clone();
            return self.fail(StmError::NoBlockingRetryAllowed(family));
        }
        let has_tracked_reads = self.attachments.iter().any(|tranlocal| {
            tranlocal.is_tracked() && matches!(tranlocal.mode(), TranlocalMode::Read | TranlocalMode::Write)
        });
        if !has_tracked_reads {
            let message = format!("{} has no tracked reads to wait on", self.config.family_name);
            return self.fail(StmError::RetryNotPossible(message));
        }
        Err(ControlFlow::Retry.into())
    }

    /// Abort and block until a reference read by the transaction changes
    ///
    /// # Errors
    /// `RetryTimeout` when the remaining timeout runs out, `RetryInterrupted`
    /// when an interruptible wait is interrupted, `RetryNotPossible` if no
    /// reference could be watched.
    pub(crate) fn await_update(&mut self) -> StmResult<()> {
        let latch = Arc::new(Latch::new());
        let mut watched: SmallVec<[Arc<dyn Watched>; 4]> = SmallVec::new();
        for tranlocal in self.attachments.iter() {
            match tranlocal.register_listener(&latch) {
                Some(Registration::Opened) => {
                    watched.push(tranlocal.watched());
                    break;
                }
                Some(Registration::Registered) => watched.push(tranlocal.watched()),
                None => {}
            }
        }
        if let Err(error) = self.abort_inner() {
            release_listeners(&watched, &latch);
            return Err(error);
        }

        if watched.is_empty() {
            return Err(StmError::RetryNotPossible(format!(
                "{} has no tracked reads to wait on",
                self.config.family_name
            )));
        }

        let interrupter = if self.config.interruptible {
            self.interrupter.as_deref()
        } else {
            None
        };
        let started = Instant::now();
        let outcome = latch.await_open(self.remaining_timeout, interrupter);
        if let Some(remaining) = self.remaining_timeout {
            self.remaining_timeout = Some(remaining.saturating_sub(started.elapsed()));
        }
        // the registries that did not fire still hold the latch
        release_listeners(&watched, &latch);

        match outcome {
            AwaitOutcome::Opened => Ok(()),
            AwaitOutcome::TimedOut => Err(StmError::RetryTimeout(format!(
                "{} waited longer than {:?}",
                self.config.family_name, self.config.timeout
            ))),
            AwaitOutcome::Interrupted => Err(StmError::RetryInterrupted(self.config.family_name.clone())),
        }
    }

    // ------------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------------

    /// Prepare the transaction for the next attempt
    ///
    /// Returns false once the retry budget is used up. Picks up an upgraded
    /// speculative configuration.
    pub fn soft_reset(&mut self) -> bool {
        if self.attempt > self.config.max_retries {
            return false;
        }
        self.attempt += 1;
        self.reinit();
        true
    }

    /// Restart from the first attempt with the full timeout
    pub fn hard_reset(&mut self) {
        self.attempt = 1;
        self.remaining_timeout = self.config.timeout;
        self.reinit();
    }

    /// Restart the current attempt with the latest speculative configuration
    pub(crate) fn speculative_reset(&mut self) {
        self.reinit();
    }

    fn reinit(&mut self) {
        if self.is_alive() {
            // invariant violations were logged by the orec
            let _ = self.abort_inner();
        }
        let current = *self.speculative.read();
        let strategy = current.attachment_strategy();
        if strategy == self.attachments.strategy() {
            self.attachments.clear();
        } else {
            self.attachments = Attachments::new(strategy);
        }
        self.rich_mans_conflict_scan = current.is_rich_mans_conflict_scan_required();
        self.status = TransactionStatus::Active;
        self.read_version = self.stm.clock().current();
        self.local_conflict_count = self.stm.conflict_counter().count();
        self.commit_conflict = false;
        self.has_writes = false;
        self.abort_only = false;
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn fail<R>(&mut self, error: StmError) -> StmResult<R> {
        if self.is_alive() {
            // invariant violations were logged by the orec
            let _ = self.abort_inner();
        }
        Err(error)
    }

    fn dead_error(&self) -> StmError {
        StmError::DeadTransaction(format!("{} is {}", self.config.family_name, self.status))
    }

    fn check_active(&self) -> StmResult<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Prepared => Err(StmError::PreparedTransaction(self.config.family_name.clone())),
            _ => Err(self.dead_error()),
        }
    }

    fn check_stm<T: TxnValue>(&self, r: &Ref<T>) -> StmResult<()> {
        if *r.stm() == self.stm {
            Ok(())
        } else {
            Err(StmError::StmMismatch(format!(
                "{} belongs to {}, transaction to {}",
                r.id(),
                r.stm().id(),
                self.stm.id()
            )))
        }
    }

    fn check_writable(&self) -> StmResult<()> {
        if self.config.readonly {
            Err(StmError::Readonly(self.config.family_name.clone()))
        } else {
            Ok(())
        }
    }

    fn check_room(&self) -> StmResult<()> {
        let required = self.attachments.len() + 1;
        if !self.rich_mans_conflict_scan && required > MAX_POOR_MANS_CONFLICT_SCAN_LENGTH {
            return Err(SpeculativeFailure::RichMansConflictScanRequired.into());
        }
        if !self.attachments.has_room() {
            return Err(SpeculativeFailure::TransactionTooSmall { required }.into());
        }
        Ok(())
    }

    fn attach(&mut self, tranlocal: Slot) -> StmResult<()> {
        let required = self.attachments.len() + 1;
        match self.attachments.attach(tranlocal) {
            Ok(()) => Ok(()),
            Err(mut rejected) => {
                rejected.release_after_failure()?;
                Err(SpeculativeFailure::TransactionTooSmall { required }.into())
            }
        }
    }

    fn locate_mut<T: TxnValue>(&mut self, id: RefId) -> StmResult<Option<&mut Tranlocal<T>>> {
        match self.attachments.locate_mut(id) {
            None => Ok(None),
            Some(slot) => match slot.as_any_mut().downcast_mut::<Tranlocal<T>>() {
                Some(tranlocal) => Ok(Some(tranlocal)),
                None => Err(lookup_failure(id)),
            },
        }
    }

    /// Whether every tracked read still reflects the committed state
    fn is_read_consistent(&mut self) -> bool {
        if self.config.isolation_level.is_inconsistent_read_allowed() {
            return true;
        }
        if self.rich_mans_conflict_scan {
            let count = self.stm.conflict_counter().count();
            if count == self.local_conflict_count {
                return true;
            }
            self.local_conflict_count = count;
        } else {
            let version = self.stm.clock().current();
            if version == self.read_version {
                return true;
            }
            self.read_version = version;
        }
        !self
            .attachments
            .iter()
            .any(|tranlocal| tranlocal.is_tracked() && tranlocal.has_read_conflict())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.abort_inner();
        }
    }
}

fn lookup_failure(id: RefId) -> StmError {
    tracing::error!(reference = %id, "attached tranlocal has an unexpected type");
    StmError::Panic(format!("attached tranlocal of {} has an unexpected type", id))
}

fn release_listeners(watched: &[Arc<dyn Watched>], latch: &Arc<Latch>) {
    for registry in watched {
        registry.deregister(latch);
    }
}
