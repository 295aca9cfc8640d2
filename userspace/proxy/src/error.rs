// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for proxy device operations.

use std::io;

/// Result type returned by proxy operations.
pub type Result<T> = core::result::Result<T, ProxyError>;

/// Errors produced by the proxy device.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum ProxyError {
    /// Both sides of the instance are already connected.
    #[error("device busy: both endpoints are connected")]
    Busy,
    /// The direction buffers could not be allocated.
    #[error("out of memory allocating direction buffers")]
    OutOfMemory,
    /// Operation could not progress without blocking.
    #[error("operation would block")]
    WouldBlock,
    /// A blocking wait was interrupted; nothing was transferred.
    #[error("interrupted while waiting; safe to retry")]
    Interrupted,
    /// A timed wait expired before the operation could progress.
    #[error("operation timed out")]
    TimedOut,
    /// The instance index is outside the registry.
    #[error("no such proxy instance: {0}")]
    NoSuchInstance(usize),
    /// The handle's access mode does not permit the operation.
    #[error("access mode does not permit this operation")]
    AccessDenied,
}

impl ProxyError {
    /// Returns `true` when retrying the same call may succeed.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::WouldBlock | Self::Interrupted | Self::TimedOut | Self::Busy)
    }
}

impl From<ProxyError> for io::Error {
    fn from(err: ProxyError) -> Self {
        let kind = match err {
            ProxyError::Busy => io::ErrorKind::AddrInUse,
            ProxyError::OutOfMemory => io::ErrorKind::OutOfMemory,
            ProxyError::WouldBlock => io::ErrorKind::WouldBlock,
            ProxyError::Interrupted => io::ErrorKind::Interrupted,
            ProxyError::TimedOut => io::ErrorKind::TimedOut,
            ProxyError::NoSuchInstance(_) => io::ErrorKind::NotFound,
            ProxyError::AccessDenied => io::ErrorKind::PermissionDenied,
        };
        io::Error::new(kind, err)
    }
}
