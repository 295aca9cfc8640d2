// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking-wait primitive for proxy direction buffers
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 5 unit tests
//!
//! PUBLIC API:
//!   - Wait enum: Wait behaviour for read/write calls
//!   - WaitQueue: Condition-variable queue with broadcast wake
//!   - Interrupt: Pending-interrupt flag for one endpoint
//!
//! INVARIANTS:
//!   - Predicates are evaluated while holding the queue lock, so a wake issued after a
//!     state change is never lost
//!   - Every wake is a broadcast; waiters re-check their predicate after waking
//!   - A pending interrupt is consumed by exactly one failed wait

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ProxyError, Result};
use crate::poll::PollerShared;

/// Behaviour of a call that may have to suspend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation can progress or is interrupted.
    Blocking,
    /// Return [`ProxyError::WouldBlock`] instead of suspending.
    NonBlocking,
    /// Block until the operation can progress, is interrupted, or the timeout expires.
    Timeout(Duration),
}

impl Wait {
    /// Maps a host non-blocking flag onto a wait mode.
    pub const fn from_nonblocking(nonblocking: bool) -> Self {
        if nonblocking {
            Self::NonBlocking
        } else {
            Self::Blocking
        }
    }

    /// Returns `true` when the caller requested a non-blocking attempt.
    pub const fn is_non_blocking(self) -> bool {
        matches!(self, Self::NonBlocking)
    }

    /// Converts a [`Wait::Timeout`] variant into its [`Duration`].
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Timeout(duration) => Some(duration),
            Self::Blocking | Self::NonBlocking => None,
        }
    }
}

/// Pending-interrupt flag attached to one endpoint.
///
/// Raising it while the endpoint is parked makes the wait fail with
/// [`ProxyError::Interrupted`]. Raising it while nothing is parked leaves it pending for
/// the next wait, the way a pending signal fails the next interruptible sleep.
#[derive(Debug, Default)]
pub struct Interrupt {
    pending: AtomicBool,
}

impl Interrupt {
    /// Creates a flag with no interrupt pending.
    pub const fn new() -> Self {
        Self { pending: AtomicBool::new(false) }
    }

    /// Marks an interrupt as pending.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns `true` if an interrupt is pending without consuming it.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Discards any pending interrupt.
    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

/// Queue of threads parked on one buffer's state transitions.
///
/// The mutex also guards the list of subscribed pollers so that a broadcast reaches both
/// parked threads and external multiplexers in one step.
pub struct WaitQueue {
    subscribers: Mutex<Vec<Weak<PollerShared>>>,
    cond: Condvar,
}

impl WaitQueue {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()), cond: Condvar::new() }
    }

    /// Parks the caller until `ready` holds.
    ///
    /// `ready` is evaluated once without the queue lock for the fast path and then under
    /// the lock before every park.
    pub fn wait_until(
        &self,
        wait: Wait,
        interrupt: &Interrupt,
        mut ready: impl FnMut() -> bool,
    ) -> Result<()> {
        if ready() {
            return Ok(());
        }
        if wait.is_non_blocking() {
            return Err(ProxyError::WouldBlock);
        }
        // An unrepresentable deadline behaves like an unbounded wait.
        let deadline = wait.timeout().and_then(|timeout| Instant::now().checked_add(timeout));

        let mut guard = self.subscribers.lock();
        loop {
            if ready() {
                return Ok(());
            }
            if interrupt.take() {
                return Err(ProxyError::Interrupted);
            }
            match deadline {
                None => self.cond.wait(&mut guard),
                Some(deadline) => {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        return if ready() { Ok(()) } else { Err(ProxyError::TimedOut) };
                    }
                }
            }
        }
    }

    /// Wakes every parked thread and notifies every live subscribed poller.
    pub fn wake_all(&self) {
        let mut subscribers = self.subscribers.lock();
        self.cond.notify_all();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(poller) => {
                poller.notify();
                true
            }
            None => false,
        });
    }

    /// Subscribes `poller` to future broadcasts. Subscribing twice is a no-op.
    pub(crate) fn subscribe(&self, poller: &Arc<PollerShared>) {
        let mut subscribers = self.subscribers.lock();
        let target = Arc::downgrade(poller);
        subscribers.retain(|weak| weak.strong_count() > 0);
        if !subscribers.iter().any(|weak| Weak::ptr_eq(weak, &target)) {
            subscribers.push(target);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
