// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-instance proxy state machine (admission, routing, EOF, readiness)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 10 unit tests
//!
//! PUBLIC API:
//!   - Side: logical side A or B of an instance
//!   - AccessMode: access mode recorded when a side connects
//!   - EndpointId: opaque identity bound to one side
//!   - Channel: admission and routing for one instance
//!   - ChannelStats: diagnostic snapshot
//!
//! INVARIANTS:
//!   - `open == occupied(A) + occupied(B)`, at most one endpoint per side
//!   - connect/disconnect are serialized by the admission lock; read/write never take it
//!   - buffers[A] carries A→B traffic, buffers[B] carries B→A traffic
//!   - buffers are allocated on first connect and live as long as the channel
//!   - a side's access mode survives its disconnect
//!
//! ERROR CONDITIONS:
//!   - ProxyError::Busy: both sides occupied
//!   - ProxyError::OutOfMemory: buffer allocation failed; the channel stays usable
//!   - An identity that does not occupy its side is a caller bug and panics, except for
//!     interrupts, which report `false`

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{ProxyError, Result};
use crate::poll::{Poller, Readiness};
use crate::ring::CircularBuffer;
use crate::wait::{Interrupt, Wait};

const VACANT: u64 = 0;

/// Logical side of an instance. Data written on one side is read on the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// First side; taken by a connect when both are free.
    A,
    /// Second side.
    B,
}

impl Side {
    /// Both sides, in assignment preference order.
    pub const ALL: [Side; 2] = [Side::A, Side::B];

    /// The opposite side.
    pub const fn peer(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Access mode requested when a side connects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccessMode {
    /// Reads only.
    ReadOnly = 0,
    /// Writes only.
    WriteOnly = 1,
    /// Reads and writes.
    ReadWrite = 2,
}

impl AccessMode {
    /// Returns `true` unless the mode is write-only.
    pub const fn can_read(self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    /// Returns `true` unless the mode is read-only.
    pub const fn can_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::ReadOnly,
            1 => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// Opaque identity of a connected endpoint.
///
/// The token is unique per connect, so an identity from a previous occupant of the same
/// side is never mistaken for the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId {
    instance: usize,
    side: Side,
    token: NonZeroU64,
}

impl EndpointId {
    /// Instance (minor) number the endpoint is connected to.
    pub const fn instance(self) -> usize {
        self.instance
    }

    /// Side the endpoint occupies.
    pub const fn side(self) -> Side {
        self.side
    }
}

struct SideSlot {
    occupant: AtomicU64,
    mode: AtomicU8,
    interrupt: Interrupt,
}

impl SideSlot {
    const fn new() -> Self {
        Self {
            occupant: AtomicU64::new(VACANT),
            mode: AtomicU8::new(AccessMode::ReadWrite as u8),
            interrupt: Interrupt::new(),
        }
    }

    fn is_vacant(&self) -> bool {
        self.occupant.load(Ordering::Acquire) == VACANT
    }

    fn mode(&self) -> AccessMode {
        AccessMode::from_raw(self.mode.load(Ordering::Acquire))
    }
}

/// Diagnostic snapshot of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelStats {
    /// Connected sides.
    pub open: u8,
    /// Per-side occupancy, indexed A then B.
    pub connected: [bool; 2],
    /// Per-side access mode, indexed A then B.
    pub modes: [AccessMode; 2],
    /// Unread bytes, A→B then B→A. Zero before the first connect.
    pub buffered: [usize; 2],
    /// Whether the direction buffers have been allocated.
    pub allocated: bool,
}

/// Admission and routing state for one proxy instance.
pub struct Channel {
    minor: usize,
    capacity: usize,
    admission: Mutex<()>,
    open: AtomicU8,
    sides: [SideSlot; 2],
    buffers: OnceCell<[CircularBuffer; 2]>,
}

impl Channel {
    /// Creates an unconnected channel whose buffers will hold `capacity` slots each.
    pub fn new(minor: usize, capacity: usize) -> Self {
        Self {
            minor,
            capacity,
            admission: Mutex::new(()),
            open: AtomicU8::new(0),
            sides: [SideSlot::new(), SideSlot::new()],
            buffers: OnceCell::new(),
        }
    }

    /// Instance (minor) number.
    pub fn minor(&self) -> usize {
        self.minor
    }

    /// Number of connected sides.
    pub fn open_count(&self) -> u8 {
        self.open.load(Ordering::Acquire)
    }

    /// Returns `true` once the direction buffers exist.
    pub fn is_allocated(&self) -> bool {
        self.buffers.get().is_some()
    }

    /// Binds a new endpoint to the first free side.
    pub fn connect(&self, mode: AccessMode, token: NonZeroU64) -> Result<EndpointId> {
        let _admission = self.admission.lock();

        let open = self.open.load(Ordering::Acquire);
        if open >= 2 {
            log::debug!("proxy{}: open rejected, both sides connected", self.minor);
            return Err(ProxyError::Busy);
        }

        let buffers = self.buffers.get_or_try_init(|| self.allocate())?;

        let side = match Side::ALL.into_iter().find(|side| self.slot(*side).is_vacant()) {
            Some(side) => side,
            None => {
                log::error!("proxy{}: inconsistent open count {open}", self.minor);
                return Err(ProxyError::Busy);
            }
        };

        // The newcomer must not see bytes written before it existed, nor a stale EOF.
        buffers[side.peer().index()].catch_up_reader();
        for buffer in buffers {
            buffer.reopen();
        }

        let slot = self.slot(side);
        slot.mode.store(mode as u8, Ordering::Release);
        slot.interrupt.clear();
        slot.occupant.store(token.get(), Ordering::Release);

        let open = open + 1;
        self.open.store(open, Ordering::Release);
        if open == 2 {
            for buffer in buffers {
                buffer.wake_all();
            }
        }

        log::debug!("proxy{}: side {side:?} connected {mode:?}, open={open}", self.minor);
        Ok(EndpointId { instance: self.minor, side, token })
    }

    /// Releases the side held by `id` and records a hard EOF on the buffer it wrote to.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not occupy its side of this channel.
    pub fn disconnect(&self, id: EndpointId) {
        let _admission = self.admission.lock();
        let buffers = self.endpoint(id);

        self.slot(id.side).occupant.store(VACANT, Ordering::Release);
        let open = self.open.load(Ordering::Acquire).saturating_sub(1);
        self.open.store(open, Ordering::Release);

        buffers[id.side.index()].mark_closed();
        for buffer in buffers {
            buffer.wake_all();
        }
        log::debug!("proxy{}: side {:?} released, open={open}", self.minor, id.side);
    }

    /// Reads from the buffer the peer writes to.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not occupy its side of this channel.
    pub fn read(&self, id: EndpointId, buf: &mut [u8], wait: Wait) -> Result<usize> {
        let buffers = self.endpoint(id);
        let inbound = &buffers[id.side.peer().index()];
        let result = inbound.read(buf, wait, &self.slot(id.side).interrupt);
        self.trace_transfer("read", id, buf.len(), &result);
        result
    }

    /// Writes to the buffer the peer reads from. Zero-length `data` signals soft EOF.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not occupy its side of this channel.
    pub fn write(&self, id: EndpointId, data: &[u8], wait: Wait) -> Result<usize> {
        let buffers = self.endpoint(id);
        let outbound = &buffers[id.side.index()];
        let result = outbound.write(
            data,
            || self.peer_connected(),
            wait,
            &self.slot(id.side).interrupt,
        );
        self.trace_transfer("write", id, data.len(), &result);
        result
    }

    /// Reports whether a read and/or write by `id` would proceed without blocking.
    ///
    /// When `poller` is given it is subscribed to both buffers first.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not occupy its side of this channel.
    pub fn poll(&self, id: EndpointId, poller: Option<&Poller>) -> Readiness {
        let buffers = self.endpoint(id);
        if let Some(poller) = poller {
            for buffer in buffers {
                buffer.subscribe(poller.shared());
            }
        }

        let own = self.slot(id.side).mode();
        let peer = self.slot(id.side.peer()).mode();
        let outbound = &buffers[id.side.index()];
        let inbound = &buffers[id.side.peer().index()];

        let readiness = Readiness {
            writable: !outbound.is_full()
                && self.peer_connected()
                && !outbound.eof_signalled()
                && own.can_write()
                && peer.can_read(),
            readable: inbound.is_readable() && own.can_read() && peer.can_write(),
        };
        log::trace!("proxy{}: poll {:?} -> {readiness:?}", self.minor, id.side);
        readiness
    }

    /// Interrupts a blocked read or write by `id`, or the next one if none is parked.
    ///
    /// Returns `false` without effect once `id` no longer occupies its side; interrupts
    /// race with the target closing its endpoint.
    pub fn interrupt(&self, id: EndpointId) -> bool {
        // Held so the flag cannot land on a newcomer that took over the side.
        let _admission = self.admission.lock();
        let Some(buffers) = self.try_endpoint(id) else {
            log::debug!("proxy{}: interrupt for departed {:?} ignored", self.minor, id.side);
            return false;
        };
        self.slot(id.side).interrupt.raise();
        for buffer in buffers {
            buffer.wake_all();
        }
        true
    }

    /// Snapshot for diagnostics.
    pub fn stats(&self) -> ChannelStats {
        let buffered = match self.buffers.get() {
            Some([a_to_b, b_to_a]) => [a_to_b.len(), b_to_a.len()],
            None => [0, 0],
        };
        ChannelStats {
            open: self.open_count(),
            connected: Side::ALL.map(|side| !self.slot(side).is_vacant()),
            modes: Side::ALL.map(|side| self.slot(side).mode()),
            buffered,
            allocated: self.is_allocated(),
        }
    }

    fn allocate(&self) -> Result<[CircularBuffer; 2]> {
        let buffers = CircularBuffer::try_with_capacity(self.capacity)
            .and_then(|a_to_b| Ok([a_to_b, CircularBuffer::try_with_capacity(self.capacity)?]));
        if buffers.is_err() {
            log::error!("proxy{}: no memory for {} byte buffers", self.minor, self.capacity);
        }
        buffers
    }

    fn peer_connected(&self) -> bool {
        self.open.load(Ordering::Acquire) == 2
    }

    fn slot(&self, side: Side) -> &SideSlot {
        &self.sides[side.index()]
    }

    fn endpoint(&self, id: EndpointId) -> &[CircularBuffer; 2] {
        match self.try_endpoint(id) {
            Some(buffers) => buffers,
            None => panic!("proxy{}: {id:?} is not connected to this instance", self.minor),
        }
    }

    fn try_endpoint(&self, id: EndpointId) -> Option<&[CircularBuffer; 2]> {
        let occupant = self.slot(id.side).occupant.load(Ordering::Acquire);
        if id.instance == self.minor && occupant == id.token.get() {
            self.buffers.get()
        } else {
            None
        }
    }

    fn trace_transfer(&self, op: &str, id: EndpointId, requested: usize, result: &Result<usize>) {
        match result {
            Ok(count) => {
                log::debug!("proxy{}: {op} {requested} -> {count} on {:?}", self.minor, id.side)
            }
            Err(ProxyError::Interrupted) => {
                log::info!("proxy{}: {op} interrupted while waiting", self.minor)
            }
            Err(err) => log::debug!("proxy{}: {op} {requested} -> {err}", self.minor),
        }
    }
}
