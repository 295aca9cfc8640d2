// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Select-driven file exchange through a proxy instance
//! OWNERS: @tools-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 6 unit tests
//!
//! PUBLIC API:
//!   - Peer: one side of an exchange, copying a source into the proxy and the peer's
//!     stream into a sink
//!   - run_pair(): runs two peers on their own threads, reporting the first failure
//!   - exchange_files(): run_pair() over input and output files
//!   - cli: argument parsing and the binary entry point
//!
//! Each peer opens its side non-blocking, then loops on `Registry::select` with the
//! interests it still has: read until the other side's end-of-stream, write until the
//! source is exhausted and the soft end-of-stream has been sent. A peer whose partner
//! disconnects before taking that end-of-stream stops with `CopyError::PeerClosed`.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod cli;

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use proxy::{ConfigError, Interest, OpenFlags, ProxyError, ProxyFile, Registry};

/// Bytes moved per proxy call.
pub const CHUNK: usize = 512;

/// How long a peer waits in `select` before re-evaluating its interests.
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced by an exchange.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The proxy rejected an operation.
    #[error("proxy: {0}")]
    Proxy(#[from] ProxyError),
    /// A source or sink failed.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    /// A peer thread panicked.
    #[error("peer {0} panicked")]
    PeerPanicked(&'static str),
    /// The other side disconnected before the named peer finished sending.
    #[error("peer of {0} closed before the exchange completed")]
    PeerClosed(&'static str),
}

/// Byte counts of one peer's exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes written into the proxy.
    pub sent: u64,
    /// Bytes read out of the proxy.
    pub received: u64,
}

/// One side of an exchange.
pub struct Peer<R, W> {
    name: &'static str,
    file: ProxyFile,
    source: R,
    sink: W,
    pending: Vec<u8>,
    offset: usize,
    source_done: bool,
    eof_sent: bool,
    peer_eof: bool,
    transfer: Transfer,
}

impl<R: Read, W: Write> Peer<R, W> {
    /// Opens a non-blocking read-write side of `instance`.
    pub fn open(
        name: &'static str,
        registry: &Arc<Registry>,
        instance: usize,
        source: R,
        sink: W,
    ) -> Result<Self, CopyError> {
        let file = registry.open(instance, OpenFlags::read_write().nonblocking())?;
        log::debug!("pxcopy: {name} opened {:?}", file.id());
        Ok(Self {
            name,
            file,
            source,
            sink,
            pending: Vec::with_capacity(CHUNK),
            offset: 0,
            source_done: false,
            eof_sent: false,
            peer_eof: false,
            transfer: Transfer::default(),
        })
    }

    /// Runs until both directions have seen end-of-stream.
    pub fn run(&mut self, registry: &Registry) -> Result<Transfer, CopyError> {
        let mut buf = [0u8; CHUNK];
        while let Some(interest) = self.interest()? {
            let ready = registry.select(&[(self.file.id(), interest)], Some(SELECT_TIMEOUT));
            let Some(&(_, readiness)) = ready.first() else {
                log::trace!("pxcopy: {} select timed out", self.name);
                continue;
            };
            if readiness.readable {
                self.pull(&mut buf)?;
            }
            if readiness.writable {
                self.push()?;
            }
        }
        self.sink.flush()?;
        log::info!(
            "pxcopy: {} done, sent {} received {}",
            self.name,
            self.transfer.sent,
            self.transfer.received
        );
        Ok(self.transfer)
    }

    /// Releases the proxy side and hands back the sink.
    pub fn into_sink(self) -> W {
        self.sink
    }

    fn interest(&mut self) -> Result<Option<Interest>, CopyError> {
        // Our end-of-stream can no longer be delivered.
        if self.peer_eof && !self.eof_sent && !self.file.peer_connected() {
            log::warn!("pxcopy: {} lost its peer with data still to send", self.name);
            return Err(CopyError::PeerClosed(self.name));
        }
        // Nothing left to write: send the soft EOF, which needs no readiness.
        if self.source_done && self.offset == self.pending.len() && !self.eof_sent {
            match self.file.signal_eof() {
                Ok(()) => {
                    log::debug!("pxcopy: {} signalled end of stream", self.name);
                    self.eof_sent = true;
                }
                Err(ProxyError::WouldBlock) => {}
                Err(err) => log::error!("pxcopy: {} eof signal failed: {err}", self.name),
            }
        }
        let interest = Interest { read: !self.peer_eof, write: !self.eof_sent };
        Ok((interest.read || interest.write).then_some(interest))
    }

    fn pull(&mut self, buf: &mut [u8]) -> Result<(), CopyError> {
        match self.file.read_bytes(buf) {
            Ok(0) => {
                log::debug!("pxcopy: {} saw peer end of stream", self.name);
                self.peer_eof = true;
            }
            Ok(n) => {
                self.sink.write_all(&buf[..n])?;
                self.transfer.received += n as u64;
            }
            Err(err) if err.is_retryable() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn push(&mut self) -> Result<(), CopyError> {
        if self.offset == self.pending.len() && !self.source_done {
            self.refill()?;
        }
        if self.offset == self.pending.len() {
            return Ok(());
        }
        match self.file.write_bytes(&self.pending[self.offset..]) {
            Ok(n) => {
                self.offset += n;
                self.transfer.sent += n as u64;
            }
            Err(err) if err.is_retryable() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn refill(&mut self) -> io::Result<()> {
        self.pending.resize(CHUNK, 0);
        let n = self.source.read(&mut self.pending)?;
        self.pending.truncate(n);
        self.offset = 0;
        if n == 0 {
            self.source_done = true;
        }
        Ok(())
    }
}

/// Input and output files of one peer.
#[derive(Clone, Debug)]
pub struct Endpoints {
    /// File copied into the proxy.
    pub input: PathBuf,
    /// File receiving what the other peer sent.
    pub output: PathBuf,
}

/// Runs `east` and `west` on their own threads until both finish.
///
/// On failure the error of whichever peer failed first is returned, so the root cause
/// wins over the `PeerClosed` it provokes on the other side.
pub fn run_pair<R, W>(
    registry: &Arc<Registry>,
    east: Peer<R, W>,
    west: Peer<R, W>,
) -> Result<(Transfer, Transfer), CopyError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let spawn = |index: usize, mut peer: Peer<R, W>| {
        let registry = Arc::clone(registry);
        let done = done_tx.clone();
        // The side is released only after the outcome is queued.
        thread::spawn(move || {
            let result = peer.run(&registry);
            let _ = done.send((index, result));
        })
    };
    let handles = [("east", spawn(0, east)), ("west", spawn(1, west))];
    drop(done_tx);

    let mut transfers = [Transfer::default(); 2];
    let mut first_error = None;
    for (index, result) in done_rx {
        match result {
            Ok(transfer) => transfers[index] = transfer,
            Err(err) => {
                log::error!("pxcopy: {} failed: {err}", handles[index].0);
                first_error.get_or_insert(err);
            }
        }
    }
    for (name, handle) in handles {
        if handle.join().is_err() {
            first_error.get_or_insert(CopyError::PeerPanicked(name));
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok((transfers[0], transfers[1])),
    }
}

/// Exchanges `east.input` for `west.input` through `instance`, on two threads.
pub fn exchange_files(
    registry: &Arc<Registry>,
    instance: usize,
    east: &Endpoints,
    west: &Endpoints,
) -> Result<(Transfer, Transfer), CopyError> {
    let east_peer = open_peer("east", registry, instance, &east.input, &east.output)?;
    let west_peer = open_peer("west", registry, instance, &west.input, &west.output)?;
    run_pair(registry, east_peer, west_peer)
}

fn open_peer(
    name: &'static str,
    registry: &Arc<Registry>,
    instance: usize,
    input: &Path,
    output: &Path,
) -> Result<Peer<File, BufWriter<File>>, CopyError> {
    let source = File::open(input)?;
    let sink = BufWriter::new(File::create(output)?);
    Peer::open(name, registry, instance, source, sink)
}
