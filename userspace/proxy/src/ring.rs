// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-capacity byte ring carrying one direction of a proxy instance
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 8 unit tests
//!
//! INVARIANTS:
//!   - Usable capacity is `capacity - 1`; one slot separates "empty" from "full"
//!   - Empty iff `read == write`; full iff `(read - write) mod capacity == 1`
//!   - Only the reader moves `read`, only the writer moves `write`
//!   - Bytes are published by a release store of the owning cursor and observed through an
//!     acquire load of it, so the single reader and single writer need no lock
//!   - `close` holds the write position at which the writer signalled end-of-stream, or
//!     `CLOSE_OPEN`

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::poll::PollerShared;
use crate::wait::{Interrupt, Wait, WaitQueue};

const CLOSE_OPEN: usize = usize::MAX;

/// One direction of a proxy instance.
pub struct CircularBuffer {
    storage: Box<[AtomicU8]>,
    write: AtomicUsize,
    read: AtomicUsize,
    close: AtomicUsize,
    queue: WaitQueue,
}

impl CircularBuffer {
    /// Allocates a ring of `capacity` bytes, reporting allocation failure instead of aborting.
    ///
    /// `capacity` must be at least 2.
    pub fn try_with_capacity(capacity: usize) -> Result<Self> {
        debug_assert!(capacity >= 2, "ring capacity must leave one usable byte");
        let mut storage: Vec<AtomicU8> = Vec::new();
        storage.try_reserve_exact(capacity).map_err(|_| ProxyError::OutOfMemory)?;
        storage.resize_with(capacity, || AtomicU8::new(0));
        Ok(Self {
            storage: storage.into_boxed_slice(),
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            close: AtomicUsize::new(CLOSE_OPEN),
            queue: WaitQueue::new(),
        })
    }

    /// Total slots, including the sacrificed one.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Largest number of bytes the ring can hold.
    pub fn usable(&self) -> usize {
        self.capacity() - 1
    }

    /// Bytes written and not yet read.
    pub fn len(&self) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        self.distance(read, write)
    }

    /// Bytes that can be written before the ring is full.
    pub fn free(&self) -> usize {
        self.usable() - self.len()
    }

    /// Returns `true` if no unread bytes remain.
    pub fn is_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    /// Returns `true` if advancing the write cursor by one would reach the read cursor.
    pub fn is_full(&self) -> bool {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Acquire);
        self.advance(write, 1) == read
    }

    /// Returns `true` if the reader has drained up to the close marker.
    pub fn at_eof(&self) -> bool {
        let close = self.close.load(Ordering::Acquire);
        close != CLOSE_OPEN && self.read.load(Ordering::Acquire) == close
    }

    /// Returns `true` if a read would return data or EOF without blocking.
    pub fn is_readable(&self) -> bool {
        !self.is_empty() || self.at_eof()
    }

    /// Returns `true` if the writer has signalled end-of-stream at the current write position.
    pub fn eof_signalled(&self) -> bool {
        self.close.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    /// Copies up to `buf.len()` unread bytes into `buf`.
    ///
    /// Returns `Ok(0)` once the reader has drained up to the close marker.
    pub fn read(&self, buf: &mut [u8], wait: Wait, interrupt: &Interrupt) -> Result<usize> {
        if self.at_eof() {
            return Ok(0);
        }
        self.queue.wait_until(wait, interrupt, || self.is_readable())?;

        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        let count = buf.len().min(self.distance(read, write));
        if count == 0 {
            // Woken by an end-of-stream marker with nothing left to drain.
            return Ok(0);
        }

        let head = count.min(self.capacity() - read);
        load_into(&mut buf[..head], &self.storage[read..read + head]);
        load_into(&mut buf[head..count], &self.storage[..count - head]);
        self.read.store(self.advance(read, count), Ordering::Release);
        log::trace!("proxy ring: read {count} bytes at {read}");

        self.queue.wake_all();
        Ok(count)
    }

    /// Copies as much of `data` as fits into the ring.
    ///
    /// Suspends while `peer_connected` is false or the ring is full. A zero-length `data`
    /// records an end-of-stream marker at the current write position.
    pub fn write(
        &self,
        data: &[u8],
        peer_connected: impl Fn() -> bool,
        wait: Wait,
        interrupt: &Interrupt,
    ) -> Result<usize> {
        self.queue.wait_until(wait, interrupt, || peer_connected() && !self.is_full())?;

        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let count = data.len().min(self.usable() - self.distance(read, write));

        let head = count.min(self.capacity() - write);
        store_from(&self.storage[write..write + head], &data[..head]);
        store_from(&self.storage[..count - head], &data[head..count]);
        let next = self.advance(write, count);
        self.write.store(next, Ordering::Release);
        if data.is_empty() {
            self.close.store(next, Ordering::Release);
            log::trace!("proxy ring: end-of-stream marked at {next}");
        } else {
            log::trace!("proxy ring: wrote {count} bytes at {write}");
        }

        self.queue.wake_all();
        Ok(count)
    }

    /// Records a hard end-of-stream at the current write position.
    pub fn mark_closed(&self) {
        self.close.store(self.write.load(Ordering::Acquire), Ordering::Release);
    }

    /// Clears any end-of-stream marker.
    pub fn reopen(&self) {
        self.close.store(CLOSE_OPEN, Ordering::Release);
    }

    /// Discards unread bytes so a new reader starts at the current write position.
    pub fn catch_up_reader(&self) {
        self.read.store(self.write.load(Ordering::Acquire), Ordering::Release);
    }

    /// Wakes every thread parked on this ring.
    pub fn wake_all(&self) {
        self.queue.wake_all();
    }

    pub(crate) fn subscribe(&self, poller: &Arc<PollerShared>) {
        self.queue.subscribe(poller);
    }

    fn advance(&self, index: usize, by: usize) -> usize {
        let next = index + by;
        if next >= self.capacity() {
            next - self.capacity()
        } else {
            next
        }
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            to + self.capacity() - from
        }
    }
}

fn load_into(dst: &mut [u8], src: &[AtomicU8]) {
    for (byte, slot) in dst.iter_mut().zip(src) {
        *byte = slot.load(Ordering::Relaxed);
    }
}

fn store_from(dst: &[AtomicU8], src: &[u8]) {
    for (slot, byte) in dst.iter().zip(src) {
        slot.store(*byte, Ordering::Relaxed);
    }
}
