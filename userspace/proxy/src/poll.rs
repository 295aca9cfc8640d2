// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Readiness reporting and readiness-change notification
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 3 unit tests
//!
//! PUBLIC API:
//!   - Readiness: readable/writable pair returned by poll
//!   - Interest: which directions a multiplexer cares about
//!   - Poller: notification channel woken by buffer state transitions
//!
//! A `Poller` passed to a readiness query is subscribed to both direction buffers of the
//! endpoint's instance. Any later broadcast on those buffers advances the poller's epoch,
//! so a multiplexer that samples the epoch before querying cannot miss a transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Readiness of one endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    /// A read would return data or EOF without blocking.
    pub readable: bool,
    /// A write of at least one byte would succeed without blocking.
    pub writable: bool,
}

impl Readiness {
    /// Neither readable nor writable.
    pub const NONE: Self = Self { readable: false, writable: false };

    /// Returns `true` if either direction is ready.
    pub const fn is_ready(self) -> bool {
        self.readable || self.writable
    }

    /// Drops the directions `interest` does not ask for.
    pub const fn masked(self, interest: Interest) -> Self {
        Self {
            readable: self.readable && interest.read,
            writable: self.writable && interest.write,
        }
    }
}

/// Directions a caller wants to be told about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    /// Interested in readability.
    pub read: bool,
    /// Interested in writability.
    pub write: bool,
}

impl Interest {
    /// Readability only.
    pub const READ: Self = Self { read: true, write: false };
    /// Writability only.
    pub const WRITE: Self = Self { read: false, write: true };
    /// Both directions.
    pub const BOTH: Self = Self { read: true, write: true };
}

pub(crate) struct PollerShared {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl PollerShared {
    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }
}

/// Readiness-change notification channel for external multiplexers.
pub struct Poller {
    shared: Arc<PollerShared>,
}

impl Poller {
    /// Creates a poller that is not yet subscribed to anything.
    pub fn new() -> Self {
        Self { shared: Arc::new(PollerShared { epoch: Mutex::new(0), cond: Condvar::new() }) }
    }

    /// Current notification epoch. Sample it before querying readiness.
    pub fn epoch(&self) -> u64 {
        *self.shared.epoch.lock()
    }

    /// Parks until the epoch moves past `seen` or `timeout` expires.
    ///
    /// Returns `true` if a notification arrived.
    pub fn wait(&self, seen: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut epoch = self.shared.epoch.lock();
        while *epoch == seen {
            match deadline {
                None => self.shared.cond.wait(&mut epoch),
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut epoch, deadline).timed_out() {
                        return *epoch != seen;
                    }
                }
            }
        }
        true
    }

    pub(crate) fn shared(&self) -> &Arc<PollerShared> {
        &self.shared
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}
