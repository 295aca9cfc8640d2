// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use proxy::{Interest, OpenFlags, ProxyConfig, ProxyFile, Registry};
use rand::{Rng, SeedableRng};

/// Quiet registry with `instances` instances of `buffer_size` byte buffers.
pub fn host_registry(buffer_size: usize, instances: usize) -> Arc<Registry> {
    let config = ProxyConfig { buffer_size, instances, debug_level: 0 };
    Arc::new(Registry::new(config).expect("registry"))
}

/// Deterministic pseudo-random payload.
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Spawns a blocking peer on `instance` that echoes every byte back until end-of-stream.
pub fn spawn_echo(registry: &Arc<Registry>, instance: usize) -> JoinHandle<usize> {
    let mut file = registry.open(instance, OpenFlags::read_write()).expect("open echo side");
    thread::spawn(move || {
        let mut buf = [0u8; 97];
        let mut echoed = 0;
        loop {
            let n = file.read(&mut buf).expect("echo read");
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).expect("echo write");
            echoed += n;
        }
        echoed
    })
}

/// Sends `data` followed by a soft end-of-stream while collecting the reply, until the
/// peer's end-of-stream. Reads and writes are multiplexed so neither ring can deadlock.
pub fn round_trip(registry: &Registry, file: &mut ProxyFile, data: &[u8]) -> Vec<u8> {
    file.set_nonblocking(true);
    let mut reply = Vec::with_capacity(data.len());
    let mut buf = [0u8; 64];
    let mut sent = 0;
    let mut eof_sent = false;
    loop {
        let interest = Interest { read: true, write: !eof_sent };
        let ready = registry.select(&[(file.id(), interest)], None);
        let readiness = ready[0].1;
        if readiness.readable {
            let n = file.read_bytes(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            reply.extend_from_slice(&buf[..n]);
        }
        if readiness.writable {
            if sent < data.len() {
                sent += file.write_bytes(&data[sent..]).expect("write");
            } else {
                file.signal_eof().expect("signal eof");
                eof_sent = true;
            }
        }
    }
    reply
}
