// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::io::{ErrorKind, Read};
use std::thread;
use std::time::Duration;

use proxy::{Interest, OpenFlags, ProxyError, Readiness};
use proxy_e2e::{host_registry, payload, round_trip, spawn_echo};
use pxcopy::{exchange_files, Endpoints, Transfer};

#[test]
fn echo_round_trip_through_small_ring() {
    let registry = host_registry(8, 1);
    let echo = spawn_echo(&registry, 0);
    let mut client = registry.open(0, OpenFlags::read_write()).unwrap();

    let data = payload(1, 5_000);
    let reply = round_trip(&registry, &mut client, &data);
    assert_eq!(reply, data);
    assert_eq!(echo.join().unwrap(), 5_000);
}

#[test]
fn independent_instances_in_parallel() {
    let registry = host_registry(32, 8);
    let clients: Vec<_> = (0..8)
        .map(|instance| {
            let echo = spawn_echo(&registry, instance);
            let registry = registry.clone();
            let client = thread::spawn(move || {
                let mut file = registry.open(instance, OpenFlags::read_write()).unwrap();
                let data = payload(instance as u64, 1_000 + instance * 311);
                (round_trip(&registry, &mut file, &data), data)
            });
            (echo, client)
        })
        .collect();

    for (echo, client) in clients {
        let (reply, data) = client.join().unwrap();
        assert_eq!(reply, data);
        assert_eq!(echo.join().unwrap(), data.len());
    }
    for instance in 0..8 {
        assert_eq!(registry.stats(instance).unwrap().open, 0);
    }
}

#[test]
fn file_exchange_matches_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let east_data = payload(7, 20_000);
    let west_data = payload(8, 333);
    fs::write(dir.path().join("east.in"), &east_data).unwrap();
    fs::write(dir.path().join("west.in"), &west_data).unwrap();
    let east = Endpoints {
        input: dir.path().join("east.in"),
        output: dir.path().join("east.out"),
    };
    let west = Endpoints {
        input: dir.path().join("west.in"),
        output: dir.path().join("west.out"),
    };

    let registry = host_registry(128, 2);
    let (e, w) = exchange_files(&registry, 1, &east, &west).unwrap();
    assert_eq!(e, Transfer { sent: 20_000, received: 333 });
    assert_eq!(w, Transfer { sent: 333, received: 20_000 });
    assert_eq!(fs::read(&east.output).unwrap(), west_data);
    assert_eq!(fs::read(&west.output).unwrap(), east_data);
}

#[test]
fn third_opener_is_rejected_as_addr_in_use() {
    let registry = host_registry(16, 1);
    let _a = registry.open(0, OpenFlags::read_write()).unwrap();
    let _b = registry.open(0, OpenFlags::read_only()).unwrap();
    let err = registry.open(0, OpenFlags::write_only()).err().unwrap();
    assert_eq!(err, ProxyError::Busy);
    assert_eq!(std::io::Error::from(err).kind(), ErrorKind::AddrInUse);
}

#[test]
fn interrupter_wakes_blocked_reader() {
    let registry = host_registry(16, 1);
    let mut reader = registry.open(0, OpenFlags::read_write()).unwrap();
    let _writer = registry.open(0, OpenFlags::read_write()).unwrap();
    let interrupter = reader.interrupter();

    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        (err.kind(), reader)
    });
    thread::sleep(Duration::from_millis(30));
    assert!(interrupter.interrupt());
    let (kind, _reader) = handle.join().unwrap();
    assert_eq!(kind, ErrorKind::Interrupted);
}

#[test]
fn select_reports_only_ready_endpoints() {
    let registry = host_registry(16, 2);
    let quiet = registry.open(0, OpenFlags::read_write()).unwrap();
    let _quiet_peer = registry.open(0, OpenFlags::read_write()).unwrap();
    let busy = registry.open(1, OpenFlags::read_write()).unwrap();
    let busy_peer = registry.open(1, OpenFlags::read_write()).unwrap();

    let interests = [(quiet.id(), Interest::READ), (busy.id(), Interest::READ)];
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        busy_peer.write_bytes(b"wake").unwrap();
        busy_peer
    });
    let ready = registry.select(&interests, Some(Duration::from_secs(5)));
    assert_eq!(ready, vec![(busy.id(), Readiness { readable: true, writable: false })]);
    sender.join().unwrap();
}
