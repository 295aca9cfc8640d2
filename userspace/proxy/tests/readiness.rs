// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for byte ordering and readiness reporting
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 3 property tests, 2 integration tests
//!
//! TEST_SCENARIOS:
//!   - bytes_arrive_in_order(): interleaved partial writes and reads preserve the stream
//!   - readiness_predicts_nonblocking_calls(): poll agrees with what a non-blocking call does
//!   - capacity_bound_holds(): buffered bytes never exceed capacity - 1
//!   - one_way_access_modes(): readiness masks follow both sides' access modes
//!   - blocking_transfer_across_threads(): large payload through a small ring

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use proxy::{AccessMode, ProxyConfig, ProxyError, Registry, Wait};

fn registry(buffer_size: usize) -> Registry {
    Registry::new(ProxyConfig { buffer_size, instances: 1, debug_level: 0 }).expect("registry")
}

#[derive(Clone, Debug)]
enum Op {
    Write { from_a: bool, len: usize },
    Read { from_a: bool, len: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<bool>(), 1usize..24).prop_map(|(from_a, len)| Op::Write { from_a, len }),
        (any::<bool>(), 1usize..24).prop_map(|(from_a, len)| Op::Read { from_a, len }),
    ]
}

proptest! {
    #[test]
    fn bytes_arrive_in_order(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..20), 1..40),
        read_sizes in prop::collection::vec(1usize..16, 1..40),
        capacity in 2usize..32,
    ) {
        let registry = registry(capacity);
        let a = registry.connect(0, AccessMode::ReadWrite).unwrap();
        let b = registry.connect(0, AccessMode::ReadWrite).unwrap();

        let mut accepted = Vec::new();
        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        for (i, chunk) in chunks.iter().enumerate() {
            match registry.write(a, chunk, Wait::NonBlocking) {
                Ok(n) => accepted.extend_from_slice(&chunk[..n]),
                Err(err) => prop_assert_eq!(err, ProxyError::WouldBlock),
            }
            let want = read_sizes[i % read_sizes.len()];
            match registry.read(b, &mut buf[..want], Wait::NonBlocking) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(err) => prop_assert_eq!(err, ProxyError::WouldBlock),
            }
        }
        registry.disconnect(a);
        loop {
            let n = registry.read(b, &mut buf, Wait::NonBlocking).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        prop_assert_eq!(received, accepted);
    }

    #[test]
    fn readiness_predicts_nonblocking_calls(
        ops in prop::collection::vec(op(), 1..60),
        capacity in 2usize..16,
    ) {
        let registry = registry(capacity);
        let a = registry.connect(0, AccessMode::ReadWrite).unwrap();
        let b = registry.connect(0, AccessMode::ReadWrite).unwrap();
        let mut buf = [0u8; 24];
        let payload = [0x5au8; 24];

        for op in ops {
            match op {
                Op::Write { from_a, len } => {
                    let id = if from_a { a } else { b };
                    let writable = registry.poll_readiness(id, None).writable;
                    let result = registry.write(id, &payload[..len], Wait::NonBlocking);
                    prop_assert_eq!(writable, result.is_ok());
                }
                Op::Read { from_a, len } => {
                    let id = if from_a { a } else { b };
                    let readable = registry.poll_readiness(id, None).readable;
                    let result = registry.read(id, &mut buf[..len], Wait::NonBlocking);
                    prop_assert_eq!(readable, result.is_ok());
                    if let Ok(n) = result {
                        prop_assert!(n > 0);
                    }
                }
            }
        }
    }

    #[test]
    fn capacity_bound_holds(
        lens in prop::collection::vec(0usize..40, 1..20),
        capacity in 2usize..32,
    ) {
        let registry = registry(capacity);
        let a = registry.connect(0, AccessMode::ReadWrite).unwrap();
        let _b = registry.connect(0, AccessMode::ReadWrite).unwrap();
        let payload = vec![1u8; 40];
        for len in lens.into_iter().filter(|len| *len > 0) {
            let before = registry.stats(0).unwrap().buffered[0];
            match registry.write(a, &payload[..len], Wait::NonBlocking) {
                Ok(n) => prop_assert_eq!(n, len.min(capacity - 1 - before)),
                Err(err) => {
                    prop_assert_eq!(err, ProxyError::WouldBlock);
                    prop_assert_eq!(before, capacity - 1);
                }
            }
            prop_assert!(registry.stats(0).unwrap().buffered[0] <= capacity - 1);
        }
    }
}

#[test]
fn one_way_access_modes() {
    let registry = registry(16);
    let reader = registry.connect(0, AccessMode::ReadOnly).unwrap();
    let writer = registry.connect(0, AccessMode::WriteOnly).unwrap();

    let r = registry.poll_readiness(reader, None);
    assert!(!r.readable && !r.writable);
    let w = registry.poll_readiness(writer, None);
    assert!(w.writable && !w.readable);

    registry.write(writer, b"data", Wait::NonBlocking).unwrap();
    assert!(registry.poll_readiness(reader, None).readable);
    assert!(!registry.poll_readiness(writer, None).readable);
}

#[test]
fn blocking_transfer_across_threads() {
    let registry = Arc::new(registry(8));
    let a = registry.connect(0, AccessMode::ReadWrite).unwrap();
    let b = registry.connect(0, AccessMode::ReadWrite).unwrap();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let writer = {
        let registry = Arc::clone(&registry);
        let payload = payload.clone();
        thread::spawn(move || {
            let mut sent = 0;
            while sent < payload.len() {
                sent += registry.write(a, &payload[sent..], Wait::Blocking).unwrap();
            }
            registry.disconnect(a);
        })
    };

    let mut received = Vec::new();
    let mut buf = [0u8; 5];
    loop {
        let n = registry.read(b, &mut buf, Wait::Blocking).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap();
    assert_eq!(received, payload);
}
