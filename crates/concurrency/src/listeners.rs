//! Per-reference registry of blocked transactions
//!
//! Each reference owns a [`ListenerRegistry`]: a lock-free singly-linked list
//! of latches. Registration prepends with a CAS; a committing writer swaps the
//! whole list out and opens every latch in it. Wakeups are at-least-once: a
//! woken transaction re-runs from scratch, so spurious wakeups are harmless.
//!
//! # Race with a concurrent commit
//!
//! A registration can complete just after a writer published a new version and
//! already took the list. The registrant re-reads the version after inserting;
//! if it moved, the registrant takes the list itself and opens it, so no latch
//! is left behind waiting for a write that already happened.
//!
//! The version publish and the list swap by the writer, and the insert and the
//! version re-read by the registrant, are all `SeqCst` so one side always
//! observes the other.
//!
//! # Deregistration
//!
//! A waiter that gives up (timeout, interruption, or a wakeup through another
//! reference) removes its latch with [`ListenerRegistry::deregister`]. The list
//! is detached, the latch dropped and the survivors put back. A writer can
//! take the list while it is detached; the same version re-read as in
//! `register` catches that and opens the survivors.

use crate::latch::Latch;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use tranquil_core::Version;

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The latch is queued and will be opened by the next writer
    Registered,
    /// The wakeup condition already held; the latch was opened right away
    Opened,
}

struct Node {
    latch: Arc<Latch>,
    minimum_wakeup_version: Version,
    next: *mut Node,
}

/// Lock-free list of latches waiting for a reference to change
pub struct ListenerRegistry {
    head: AtomicPtr<Node>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("empty", &self.is_empty())
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        ListenerRegistry {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether no latch is queued
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Queue `latch` until `version` reaches `minimum_wakeup_version`
    ///
    /// `version` is the committed version of the owning reference.
    pub fn register(
        &self,
        latch: &Arc<Latch>,
        minimum_wakeup_version: Version,
        version: &AtomicU64,
    ) -> Registration {
        if version.load(Ordering::SeqCst) >= minimum_wakeup_version {
            latch.open();
            return Registration::Opened;
        }

        let node = Box::into_raw(Box::new(Node {
            latch: Arc::clone(latch),
            minimum_wakeup_version,
            next: ptr::null_mut(),
        }));

        loop {
            if version.load(Ordering::SeqCst) >= minimum_wakeup_version {
                // SAFETY: `node` was never published, this thread still owns it.
                drop(unsafe { Box::from_raw(node) });
                latch.open();
                return Registration::Opened;
            }

            let current = self.head.load(Ordering::SeqCst);
            // SAFETY: `node` is unpublished until the CAS below succeeds.
            unsafe { (*node).next = current };

            if self
                .head
                .compare_exchange(current, node, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            if version.load(Ordering::SeqCst) < minimum_wakeup_version {
                return Registration::Registered;
            }

            // a writer published before seeing our node
            for waiting in self.take_all() {
                waiting.open();
            }
            return Registration::Opened;
        }
    }

    /// Remove every queue entry for `latch`
    ///
    /// Returns whether an entry was found. `version` is the committed version
    /// of the owning reference.
    pub fn deregister(&self, latch: &Arc<Latch>, version: &AtomicU64) -> bool {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut removed = false;
        let mut kept: Vec<*mut Node> = Vec::new();
        while !node.is_null() {
            // SAFETY: the swap made this thread the only owner of the detached
            // list; every node was created by `Box::into_raw` in `register`.
            let next = unsafe { (*node).next };
            if unsafe { Arc::ptr_eq(&(*node).latch, latch) } {
                drop(unsafe { Box::from_raw(node) });
                removed = true;
            } else {
                kept.push(node);
            }
            node = next;
        }

        let (first, last) = match (kept.first(), kept.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return removed,
        };
        let mut earliest = Version::MAX;
        for pair in kept.windows(2) {
            // SAFETY: still exclusively owned, not yet republished.
            unsafe { (*pair[0]).next = pair[1] };
        }
        for &node in &kept {
            // SAFETY: as above.
            earliest = earliest.min(unsafe { (*node).minimum_wakeup_version });
        }

        loop {
            let current = self.head.load(Ordering::SeqCst);
            // SAFETY: `last` is unpublished until the CAS below succeeds.
            unsafe { (*last).next = current };
            if self
                .head
                .compare_exchange(current, first, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        // a writer may have taken the list while the survivors were detached
        if version.load(Ordering::SeqCst) >= earliest {
            self.open_all();
        }
        removed
    }

    /// Detach every queued latch
    ///
    /// The caller becomes responsible for opening them.
    pub fn take_all(&self) -> Vec<Arc<Latch>> {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut latches = Vec::new();
        while !node.is_null() {
            // SAFETY: the swap made this thread the only owner of the detached
            // list; every node was created by `Box::into_raw` in `register`.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
            latches.push(boxed.latch);
        }
        latches
    }

    /// Detach and open every queued latch
    pub fn open_all(&self) -> usize {
        let latches = self.take_all();
        for latch in &latches {
            latch.open();
        }
        latches.len()
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        self.take_all();
    }
}
