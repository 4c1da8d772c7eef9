//! Single-use wakeup for blocking retry
//!
//! A transaction that retries registers one [`Latch`] with every reference it
//! read, then waits on it. The first commit touching any of those references
//! opens the latch. Opening is idempotent and a latch never closes again, so a
//! fresh latch is used for every wait.
//!
//! An [`Interrupter`] lets another thread wake a waiter without opening its
//! latch; the waiter then reports [`AwaitOutcome::Interrupted`].

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of waiting on a latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The latch was opened
    Opened,
    /// The timeout elapsed first
    TimedOut,
    /// The interrupter fired first
    Interrupted,
}

/// Single-use gate
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Create a closed latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the latch and wake every waiter
    pub fn open(&self) {
        let mut open = self.open.lock();
        if !*open {
            *open = true;
            self.cond.notify_all();
        }
    }

    /// Whether the latch was opened
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn wake(&self) {
        let _guard = self.open.lock();
        self.cond.notify_all();
    }

    /// Block until the latch opens, the timeout elapses, or the interrupter fires
    ///
    /// `None` as timeout waits without limit. Interruption is only observed when
    /// an interrupter is passed; its flag is cleared when it is reported.
    pub fn await_open(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        interrupter: Option<&Interrupter>,
    ) -> AwaitOutcome {
        if let Some(interrupter) = interrupter {
            interrupter.watch(self);
        }
        let outcome = self.wait(timeout.map(|t| Instant::now() + t), interrupter);
        if let Some(interrupter) = interrupter {
            interrupter.unwatch();
        }
        outcome
    }

    fn wait(&self, deadline: Option<Instant>, interrupter: Option<&Interrupter>) -> AwaitOutcome {
        let mut open = self.open.lock();
        loop {
            if *open {
                return AwaitOutcome::Opened;
            }
            if interrupter.map_or(false, Interrupter::take_interrupted) {
                return AwaitOutcome::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut open, deadline).timed_out() && !*open {
                        return AwaitOutcome::TimedOut;
                    }
                }
                None => self.cond.wait(&mut open),
            }
        }
    }
}

/// Handle for interrupting a blocked retry from another thread
///
/// # Example
///
/// ```ignore
/// let interrupter = Arc::new(Interrupter::new());
/// let handle = Arc::clone(&interrupter);
/// thread::spawn(move || handle.interrupt());
/// executor.execute_interruptible(&interrupter, |tx| { ... });
/// ```
#[derive(Debug, Default)]
pub struct Interrupter {
    interrupted: AtomicBool,
    watching: Mutex<Option<Arc<Latch>>>,
}

impl Interrupter {
    /// Create an interrupter with the flag cleared
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake the latch currently being waited on, if any
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(latch) = self.watching.lock().as_ref() {
            latch.wake();
        }
    }

    /// Whether the flag is set
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning its previous value
    pub fn take_interrupted(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    fn watch(&self, latch: &Arc<Latch>) {
        *self.watching.lock() = Some(Arc::clone(latch));
    }

    fn unwatch(&self) {
        self.watching.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn open_is_idempotent() {
        let latch = Latch::new();
        assert!(!latch.is_open());
        latch.open();
        latch.open();
        assert!(latch.is_open());
    }

    #[test]
    fn open_latch_returns_immediately() {
        let latch = Arc::new(Latch::new());
        latch.open();
        assert_eq!(latch.await_open(Some(Duration::ZERO), None), AwaitOutcome::Opened);
    }

    #[test]
    fn await_times_out() {
        let latch = Arc::new(Latch::new());
        let start = Instant::now();
        let outcome = latch.await_open(Some(Duration::from_millis(20)), None);
        assert_eq!(outcome, AwaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn opened_from_another_thread() {
        let latch = Arc::new(Latch::new());
        let opener = Arc::clone(&latch);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            opener.open();
        });
        assert_eq!(latch.await_open(None, None), AwaitOutcome::Opened);
        handle.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_without_opening() {
        let latch = Arc::new(Latch::new());
        let interrupter = Arc::new(Interrupter::new());
        let remote = Arc::clone(&interrupter);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.interrupt();
        });

        let outcome = latch.await_open(Some(Duration::from_secs(10)), Some(&interrupter));
        assert_eq!(outcome, AwaitOutcome::Interrupted);
        assert!(!latch.is_open());
        assert!(!interrupter.is_interrupted());
        handle.join().unwrap();
    }

    #[test]
    fn pending_interrupt_is_reported_immediately() {
        let latch = Arc::new(Latch::new());
        let interrupter = Interrupter::new();
        interrupter.interrupt();
        assert_eq!(latch.await_open(None, Some(&interrupter)), AwaitOutcome::Interrupted);
    }
}
