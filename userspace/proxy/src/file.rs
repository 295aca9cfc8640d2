// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process stand-in for the host's file dispatch layer
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 6 unit tests
//!
//! PUBLIC API:
//!   - OpenFlags: access mode plus non-blocking flag supplied at open time
//!   - ProxyFile: open handle; disconnects its endpoint on drop
//!   - Interrupter: cloneable handle that interrupts a ProxyFile's blocked call
//!
//! ERROR CONDITIONS:
//!   - ProxyError::AccessDenied: read on a write-only handle or write on a read-only one
//!   - Everything else is forwarded from the registry unchanged
//!
//! `std::io::Write::write` with an empty buffer is forwarded as the soft end-of-stream
//! signal; `write_all` never issues such a call.

use std::io;
use std::sync::Arc;

use crate::channel::{AccessMode, EndpointId};
use crate::error::{ProxyError, Result};
use crate::poll::{Poller, Readiness};
use crate::registry::Registry;
use crate::wait::Wait;

/// Flags an opener supplies, mirroring `O_RDONLY`/`O_WRONLY`/`O_RDWR` and `O_NONBLOCK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    mode: AccessMode,
    nonblocking: bool,
}

impl OpenFlags {
    /// Blocking open with `mode`.
    pub const fn new(mode: AccessMode) -> Self {
        Self { mode, nonblocking: false }
    }

    /// Blocking read-only open.
    pub const fn read_only() -> Self {
        Self::new(AccessMode::ReadOnly)
    }

    /// Blocking write-only open.
    pub const fn write_only() -> Self {
        Self::new(AccessMode::WriteOnly)
    }

    /// Blocking read-write open.
    pub const fn read_write() -> Self {
        Self::new(AccessMode::ReadWrite)
    }

    /// Same flags with the non-blocking bit set.
    pub const fn nonblocking(self) -> Self {
        Self { mode: self.mode, nonblocking: true }
    }

    /// Access mode.
    pub const fn mode(self) -> AccessMode {
        self.mode
    }

    /// Returns `true` if calls fail with `WouldBlock` instead of suspending.
    pub const fn is_nonblocking(self) -> bool {
        self.nonblocking
    }
}

impl Registry {
    /// Opens `instance` the way the host dispatch layer would.
    pub fn open(self: &Arc<Self>, instance: usize, flags: OpenFlags) -> Result<ProxyFile> {
        let id = self.connect(instance, flags.mode)?;
        Ok(ProxyFile { registry: Arc::clone(self), id, flags })
    }
}

/// Open handle on one side of a proxy instance.
pub struct ProxyFile {
    registry: Arc<Registry>,
    id: EndpointId,
    flags: OpenFlags,
}

impl ProxyFile {
    /// Endpoint identity bound to this handle.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Flags the handle was opened with, including later non-blocking changes.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Switches between blocking and non-blocking calls.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.flags.nonblocking = nonblocking;
    }

    /// Reads bytes from the peer; `Ok(0)` is end-of-stream.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags.mode.can_read() {
            return Err(ProxyError::AccessDenied);
        }
        self.registry.read(self.id, buf, self.wait())
    }

    /// Writes bytes for the peer; may transfer fewer than `data.len()`.
    pub fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        if !self.flags.mode.can_write() {
            return Err(ProxyError::AccessDenied);
        }
        self.registry.write(self.id, data, self.wait())
    }

    /// Tells the peer no more data follows, keeping this handle open.
    pub fn signal_eof(&self) -> Result<()> {
        self.write_bytes(&[]).map(|_| ())
    }

    /// Current readiness; subscribes `poller` when given.
    pub fn poll(&self, poller: Option<&Poller>) -> Readiness {
        self.registry.poll_readiness(self.id, poller)
    }

    /// Returns `true` while the other side of the instance is connected.
    pub fn peer_connected(&self) -> bool {
        self.registry
            .stats(self.id.instance())
            .map(|stats| stats.open == 2)
            .unwrap_or(false)
    }

    /// Handle other threads can use to interrupt this file's blocked calls.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter { registry: Arc::clone(&self.registry), id: self.id }
    }

    fn wait(&self) -> Wait {
        Wait::from_nonblocking(self.flags.nonblocking)
    }
}

impl io::Read for ProxyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl io::Write for ProxyFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ProxyFile {
    fn drop(&mut self) {
        self.registry.disconnect(self.id);
    }
}

/// Delivers interrupts to one [`ProxyFile`] from any thread.
///
/// Outliving the file is harmless: interrupts after it closed are dropped.
#[derive(Clone)]
pub struct Interrupter {
    registry: Arc<Registry>,
    id: EndpointId,
}

impl Interrupter {
    /// Interrupts the file's blocked call, or its next blocking wait.
    ///
    /// Returns `false` if the file has already been closed.
    pub fn interrupt(&self) -> bool {
        self.registry.interrupt(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use std::io::{Read, Write};

    fn registry() -> Arc<Registry> {
        let config = ProxyConfig { buffer_size: 32, instances: 2, debug_level: 0 };
        Arc::new(Registry::new(config).unwrap())
    }

    #[test]
    fn drop_disconnects() {
        let registry = registry();
        let file = registry.open(0, OpenFlags::read_write()).unwrap();
        assert_eq!(registry.stats(0).unwrap().open, 1);
        drop(file);
        assert_eq!(registry.stats(0).unwrap().open, 0);
    }

    #[test]
    fn io_traits_carry_bytes() {
        let registry = registry();
        let mut east = registry.open(1, OpenFlags::read_write()).unwrap();
        let mut west = registry.open(1, OpenFlags::read_write().nonblocking()).unwrap();
        east.write_all(b"through the proxy").unwrap();
        let mut buf = [0u8; 64];
        let n = west.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"through the proxy");
        let err = west.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn access_mode_enforced() {
        let registry = registry();
        let reader = registry.open(0, OpenFlags::read_only()).unwrap();
        let writer = registry.open(0, OpenFlags::write_only()).unwrap();
        assert_eq!(reader.write_bytes(b"x").unwrap_err(), ProxyError::AccessDenied);
        let mut buf = [0u8; 1];
        assert_eq!(writer.read_bytes(&mut buf).unwrap_err(), ProxyError::AccessDenied);
    }

    #[test]
    fn interrupter_outlives_its_file() {
        let registry = registry();
        let file = registry.open(0, OpenFlags::read_write()).unwrap();
        let interrupter = file.interrupter();
        assert!(interrupter.interrupt());
        drop(file);
        assert!(!interrupter.interrupt());

        // A later opener of the same side is not affected.
        let reopened = registry.open(0, OpenFlags::read_write()).unwrap();
        assert_eq!(reopened.id().side(), interrupter.id.side());
        assert!(!interrupter.interrupt());
        let mut buf = [0u8; 1];
        let wait = Wait::Timeout(std::time::Duration::from_millis(10));
        let err = registry.read(reopened.id(), &mut buf, wait).unwrap_err();
        assert_eq!(err, ProxyError::TimedOut);
    }

    #[test]
    fn peer_presence_tracks_connects() {
        let registry = registry();
        let east = registry.open(1, OpenFlags::read_write()).unwrap();
        assert!(!east.peer_connected());
        let west = registry.open(1, OpenFlags::read_write()).unwrap();
        assert!(east.peer_connected());
        drop(west);
        assert!(!east.peer_connected());
    }

    #[test]
    fn read_to_end_stops_at_close() {
        let registry = registry();
        let mut writer = registry.open(0, OpenFlags::read_write()).unwrap();
        let mut reader = registry.open(0, OpenFlags::read_write()).unwrap();
        writer.write_all(b"last words").unwrap();
        drop(writer);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"last words");
    }
}
