//! Search and failure handling against the simulated bus.

use std::collections::HashSet;

use owbus::adapter::fake::{FakeAdapter, FakeDevice, FakeHandle};
use owbus::adapter::Transport;
use owbus::address::Address;
use owbus::connection::{ConnectionRegistry, ReconnectState};
use owbus::search::SearchMode;
use owbus::transaction::{Step, Target};
use owbus::Error;

fn address(family: u8, serial: u8) -> Address {
    Address::from_family_serial(family, [serial, serial ^ 0x5A, 0, 0, 0, serial])
}

fn open(registry: &ConnectionRegistry, devices: Vec<FakeDevice>) -> (usize, FakeHandle) {
    let adapter = FakeAdapter::new(devices);
    let handle = adapter.handle();
    let connection = registry
        .open(Transport::Fake { devices: vec![] }, Box::new(adapter))
        .unwrap();
    (connection.index(), handle)
}

#[test]
fn search_finds_every_device_once() {
    let addresses: Vec<Address> = [0x10, 0x10, 0x01, 0x2D, 0x3A, 0x10, 0x81]
        .iter()
        .enumerate()
        .map(|(n, &family)| address(family, n as u8 + 1))
        .collect();
    let registry = ConnectionRegistry::new(3);
    let (index, _) = open(&registry, addresses.iter().copied().map(FakeDevice::new).collect());

    let found = registry.get(index).unwrap().search(SearchMode::Normal).unwrap();
    assert_eq!(found.len(), addresses.len());
    let unique: HashSet<_> = found.iter().collect();
    assert_eq!(unique.len(), addresses.len());
    assert!(found.iter().all(|a| a.is_valid() && addresses.contains(a)));
}

#[test]
fn family_search_stays_in_family() {
    let registry = ConnectionRegistry::new(3);
    let devices = vec![
        FakeDevice::new(address(0x10, 1)),
        FakeDevice::new(address(0x01, 2)),
        FakeDevice::new(address(0x10, 3)),
        FakeDevice::new(address(0x2D, 4)),
    ];
    let (index, _) = open(&registry, devices);

    let found = registry
        .get(index)
        .unwrap()
        .search(SearchMode::Family(0x10))
        .unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|a| a.family() == 0x10));
}

#[test]
fn alarm_search_returns_alarming_devices() {
    let registry = ConnectionRegistry::new(3);
    let mut alarming = FakeDevice::new(address(0x10, 7));
    alarming.set_alarm(true);
    let (index, _) = open(&registry, vec![FakeDevice::new(address(0x10, 6)), alarming]);

    let found = registry.get(index).unwrap().search(SearchMode::Alarm).unwrap();
    assert_eq!(found, vec![address(0x10, 7)]);
}

#[test]
fn empty_bus_finds_nothing() {
    let registry = ConnectionRegistry::new(3);
    let (index, _) = open(&registry, vec![]);
    assert!(registry
        .get(index)
        .unwrap()
        .search(SearchMode::Normal)
        .unwrap()
        .is_empty());
}

#[test]
fn repeated_failures_mark_bus_bad() {
    let registry = ConnectionRegistry::new(3);
    let device = FakeDevice::new(address(0x10, 1));
    let target = Target::device(device.address());
    let (index, handle) = open(&registry, vec![device]);
    let connection = registry.get(index).unwrap();

    let read = || {
        let mut data = [0u8; 9];
        connection.transaction(
            &target,
            &mut [
                Step::Select,
                Step::Write(&[0xBE]),
                Step::Read(&mut data),
                Step::Crc8,
                Step::End,
            ],
        )
    };

    handle.fail_operations(100);
    for attempt in 1..=3 {
        let err = read().unwrap_err();
        assert!(err.is_transport(), "attempt {attempt}: {err}");
    }
    assert_eq!(connection.state(), ReconnectState::Bad);
    assert_eq!(connection.stats().reconnects, 2);

    let operations = handle.operations();
    assert!(matches!(read(), Err(Error::PermanentFailure(i)) if i == index));
    assert_eq!(handle.operations(), operations);
}

#[test]
fn success_resets_failure_count() {
    let registry = ConnectionRegistry::new(2);
    let device = FakeDevice::new(address(0x10, 1));
    let target = Target::device(device.address());
    let (index, handle) = open(&registry, vec![device]);
    let connection = registry.get(index).unwrap();
    let present = || {
        connection.transaction(
            &target,
            &mut [Step::Select, Step::Verify(SearchMode::Normal), Step::End],
        )
    };

    for _ in 0..4 {
        handle.fail_operations(1);
        assert!(present().is_err());
        present().unwrap();
    }
    assert_eq!(connection.state(), ReconnectState::Ok);
}
