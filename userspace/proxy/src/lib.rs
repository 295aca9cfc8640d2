// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bidirectional two-endpoint byte-stream device ("proxy")
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + integration tests in tests/
//!
//! Each instance connects exactly two parties. Whatever one side writes, the other reads,
//! through a fixed-capacity ring per direction. Writers block while the ring is full or
//! the peer is absent; readers block while their ring is empty. Both honour a
//! non-blocking mode and report readiness for `select`-style multiplexing.
//!
//! End-of-stream comes in two forms:
//!   - hard: a side disconnects; its peer drains what was written and then reads 0
//!   - soft: a side writes zero bytes; its peer reads 0 once drained, the connection stays up
//!
//! PUBLIC API:
//!   - Registry: instance table and endpoint operations
//!   - ProxyFile/OpenFlags: file-like handle with `std::io` integration
//!   - Poller/Readiness/Interest: readiness reporting and multiplexing
//!   - ProxyConfig: buffer size, instance count, verbosity
//!   - ProxyError: error taxonomy
//!
//! DEPENDENCIES:
//!   - parking_lot: admission lock and wait queues
//!   - once_cell: lazy buffer allocation
//!   - log: diagnostics, levels chosen by `ProxyConfig::debug_level`
//!   - serde/toml: configuration files
//!
//! ```
//! use proxy::{AccessMode, ProxyConfig, Registry, Wait};
//!
//! let registry = Registry::new(ProxyConfig::default()).unwrap();
//! let east = registry.connect(0, AccessMode::ReadWrite).unwrap();
//! let west = registry.connect(0, AccessMode::ReadWrite).unwrap();
//! registry.write(east, b"hello", Wait::Blocking).unwrap();
//! let mut buf = [0u8; 8];
//! let n = registry.read(west, &mut buf, Wait::Blocking).unwrap();
//! assert_eq!(&buf[..n], b"hello");
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod channel;
mod config;
mod error;
mod file;
mod poll;
mod registry;
mod ring;
mod wait;

pub use channel::{AccessMode, Channel, ChannelStats, EndpointId, Side};
pub use config::{
    ConfigError, ProxyConfig, CONFIG_ENV, DEFAULT_BUFFER_SIZE, DEFAULT_DEBUG_LEVEL,
    DEFAULT_INSTANCES, MAX_DEBUG_LEVEL, MAX_INSTANCES,
};
pub use error::{ProxyError, Result};
pub use file::{Interrupter, OpenFlags, ProxyFile};
pub use poll::{Interest, Poller, Readiness};
pub use registry::Registry;
pub use ring::CircularBuffer;
pub use wait::{Interrupt, Wait, WaitQueue};
