// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed-size table of proxy instances and the endpoint operations on it
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 9 unit tests
//!
//! PUBLIC API:
//!   - Registry::new(): create every instance up front
//!   - connect/disconnect/read/write/poll_readiness/interrupt: endpoint operations
//!   - select(): wait until any of a set of endpoints is ready
//!   - stats()/shutdown(): introspection and explicit teardown
//!
//! The registry is passed explicitly to every operation; there is no global instance.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::channel::{AccessMode, Channel, ChannelStats, EndpointId};
use crate::config::{ConfigError, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::poll::{Interest, Poller, Readiness};
use crate::wait::Wait;

/// All proxy instances of one host.
pub struct Registry {
    config: ProxyConfig,
    channels: Box<[Channel]>,
    next_token: AtomicU64,
}

impl Registry {
    /// Validates `config` and creates `config.instances` unconnected instances.
    pub fn new(config: ProxyConfig) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        let channels = (0..config.instances)
            .map(|minor| Channel::new(minor, config.buffer_size))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        log::info!(
            "proxy: installed {} instances with {} byte buffers",
            config.instances,
            config.buffer_size
        );
        Ok(Self { config, channels, next_token: AtomicU64::new(1) })
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Number of addressable instances.
    pub fn instances(&self) -> usize {
        self.channels.len()
    }

    /// Binds a new endpoint with `mode` to a free side of `instance`.
    pub fn connect(&self, instance: usize, mode: AccessMode) -> Result<EndpointId> {
        log::debug!("proxy: open instance {instance} {mode:?}");
        let channel = self.channels.get(instance).ok_or(ProxyError::NoSuchInstance(instance))?;
        channel.connect(mode, self.issue_token())
    }

    /// Releases `id`'s side; data it wrote stays readable up to the recorded EOF.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently connected.
    pub fn disconnect(&self, id: EndpointId) {
        self.channel_of(id).disconnect(id);
    }

    /// Reads bytes written by `id`'s peer. `Ok(0)` means end-of-stream.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently connected.
    pub fn read(&self, id: EndpointId, buf: &mut [u8], wait: Wait) -> Result<usize> {
        self.channel_of(id).read(id, buf, wait)
    }

    /// Writes bytes for `id`'s peer. Zero-length `data` is the soft end-of-stream signal.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently connected.
    pub fn write(&self, id: EndpointId, data: &[u8], wait: Wait) -> Result<usize> {
        self.channel_of(id).write(id, data, wait)
    }

    /// Reports readiness without blocking, optionally subscribing `poller` to changes.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently connected.
    pub fn poll_readiness(&self, id: EndpointId, poller: Option<&Poller>) -> Readiness {
        self.channel_of(id).poll(id, poller)
    }

    /// Interrupts `id`'s blocked read or write, or its next blocking wait.
    ///
    /// Returns `false` if `id` has already disconnected.
    pub fn interrupt(&self, id: EndpointId) -> bool {
        self.channel_of(id).interrupt(id)
    }

    /// Returns the ready subset of `interests`, waiting up to `timeout` (forever if `None`)
    /// when none is ready. An empty result means the timeout expired or `interests` is empty.
    ///
    /// # Panics
    ///
    /// Panics if any endpoint is not currently connected.
    pub fn select(
        &self,
        interests: &[(EndpointId, Interest)],
        timeout: Option<Duration>,
    ) -> Vec<(EndpointId, Readiness)> {
        if interests.is_empty() {
            return Vec::new();
        }
        let poller = Poller::new();
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            let seen = poller.epoch();
            let ready: Vec<_> = interests
                .iter()
                .filter_map(|&(id, interest)| {
                    let readiness = self.poll_readiness(id, Some(&poller)).masked(interest);
                    readiness.is_ready().then_some((id, readiness))
                })
                .collect();
            if !ready.is_empty() {
                return ready;
            }
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) if !remaining.is_zero() => Some(remaining),
                    _ => return ready,
                },
                None => None,
            };
            poller.wait(seen, remaining);
        }
    }

    /// Diagnostic snapshot of `instance`.
    pub fn stats(&self, instance: usize) -> Result<ChannelStats> {
        self.channels
            .get(instance)
            .map(Channel::stats)
            .ok_or(ProxyError::NoSuchInstance(instance))
    }

    /// Tears down every instance and releases all direction buffers.
    pub fn shutdown(self) {
        let connected: usize =
            self.channels.iter().map(|channel| usize::from(channel.open_count())).sum();
        if connected > 0 {
            log::warn!("proxy: uninstalling with {connected} endpoints still connected");
        }
        let allocated = self.channels.iter().filter(|channel| channel.is_allocated()).count();
        drop(self.channels);
        log::info!("proxy: uninstalled, released buffers of {allocated} instances");
    }

    fn issue_token(&self) -> NonZeroU64 {
        let raw = self.next_token.fetch_add(1, Ordering::Relaxed);
        NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN)
    }

    fn channel_of(&self, id: EndpointId) -> &Channel {
        &self.channels[id.instance()]
    }
}
