//! Bus connections.
//!
//! A [`Connection`] is one physical or remote 1-Wire bus: its adapter, the
//! transport description, statistics, reconnect state, and the locks that
//! serialise access to it. Two levels of locking apply:
//!
//! - the bus lock ([`Connection::lock`]) is held for the duration of one or
//!   more transactions that must not be interleaved with anyone else's;
//! - device locks ([`Connection::lock_device`]) keep multi-transaction
//!   operations on one device (read-modify-write, page programming)
//!   together. They are taken before the bus lock, never while holding it.
//!
//! Connections are shared as `Arc<Connection>` between request threads.

pub mod reconnect;
pub mod registry;
pub mod stats;

use parking_lot::{ArcMutexGuard, Mutex, MutexGuard, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::adapter::{coupler, Adapter, AdapterFlags, AdapterKind, Transport};
use crate::address::Address;
use crate::device::ds18s20;
use crate::error::{Error, Result};
use crate::search::{DeviceSearch, SearchMode};
use crate::tracing::prelude::*;
use crate::transaction::{BusPath, Step, StepKind, Target};

pub use reconnect::ReconnectState;
pub use registry::{ConnectionRegistry, OutboundEndpoint};
pub use stats::BusStatistics;

use reconnect::Reconnect;

/// Conversion time of a 12-bit temperature sensor.
pub const CONVERSION_TIME: Duration = Duration::from_millis(750);

/// Everything guarded by the bus lock.
struct Bus {
    adapter: Box<dyn Adapter>,
    reconnect: Reconnect,
    /// Coupler path currently switched on
    branch: BusPath,
    /// When a simultaneous temperature conversion last completed
    simultaneous: Option<Instant>,
}

impl Bus {
    /// Switch couplers off when the target is on another branch.
    fn switch_branch(&mut self, target: &Target) -> Result<()> {
        if !self.adapter.flags().contains(AdapterFlags::BRANCH_PATH) || self.branch == target.path {
            return Ok(());
        }
        if !self.branch.is_empty() {
            trace!(from = %self.branch, to = %target.path, "switching branch");
            self.adapter.select(&Target::broadcast())?;
            let mut resp = [0u8; 2];
            self.adapter
                .sendback_bytes(&[coupler::ALL_LINES_OFF, 0xFF], &mut resp)?;
            if resp[1] != coupler::ALL_LINES_OFF {
                return Err(Error::transport(
                    StepKind::Select,
                    "couplers did not confirm all lines off",
                ));
            }
        }
        self.branch = BusPath::default();
        Ok(())
    }
}

/// One bus.
pub struct Connection {
    index: usize,
    transport: Transport,
    adapter_name: String,
    flags: AdapterFlags,
    bus: Mutex<Bus>,
    devices: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
    stats: Mutex<BusStatistics>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("transport", &self.transport)
            .field("adapter", &self.adapter_name)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap an already detected adapter.
    pub fn new(
        index: usize,
        transport: Transport,
        adapter: Box<dyn Adapter>,
        reconnect_limit: u32,
    ) -> Result<Self> {
        if transport.kind() != adapter.kind() {
            return Err(Error::Config(format!(
                "{} transport given to a {} adapter",
                transport.kind(),
                adapter.kind()
            )));
        }
        Ok(Self {
            index,
            adapter_name: adapter.name().to_string(),
            flags: adapter.flags(),
            transport,
            bus: Mutex::new(Bus {
                adapter,
                reconnect: Reconnect::new(reconnect_limit),
                branch: BusPath::default(),
                simultaneous: None,
            }),
            devices: Mutex::new(HashMap::new()),
            stats: Mutex::new(BusStatistics::default()),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn kind(&self) -> AdapterKind {
        self.transport.kind()
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn flags(&self) -> AdapterFlags {
        self.flags
    }

    pub fn stats(&self) -> BusStatistics {
        self.stats.lock().clone()
    }

    pub fn state(&self) -> ReconnectState {
        self.bus.lock().reconnect.state()
    }

    /// Take the bus lock.
    pub fn lock(&self) -> BusGuard<'_> {
        let bus = self.bus.lock();
        {
            let mut stats = self.stats.lock();
            stats.locks += 1;
            stats.last_lock = Some(SystemTime::now());
        }
        BusGuard {
            connection: self,
            bus,
            since: Instant::now(),
        }
    }

    /// Run one transaction under its own bus lock.
    pub fn transaction(&self, target: &Target, steps: &mut [Step<'_>]) -> Result<()> {
        self.lock().transaction(target, steps)
    }

    /// Enumerate the bus.
    pub fn search(&self, mode: SearchMode) -> Result<Vec<Address>> {
        self.lock().search(mode)
    }

    /// Serialise operations on one device.
    pub fn lock_device(&self, address: Address) -> DeviceLock<'_> {
        let entry = Arc::clone(self.devices.lock().entry(address).or_default());
        let guard = entry.lock_arc();
        DeviceLock {
            connection: self,
            address,
            guard: Some(guard),
        }
    }

    /// Probe the adapter again and, if it answers, return a bad connection
    /// to service.
    pub fn redetect(&self) -> Result<()> {
        let mut bus = self.bus.lock();
        bus.adapter.close();
        bus.adapter.detect()?;
        bus.reconnect.reset();
        bus.branch = BusPath::default();
        info!(bus = self.index, "bus redetected");
        Ok(())
    }

    pub fn close(&self) {
        self.bus.lock().adapter.close();
        debug!(bus = self.index, "connection closed");
    }

    /// Start a temperature conversion on every device at once.
    pub fn trigger_simultaneous_temperature(&self) -> Result<()> {
        let mut guard = self.lock();
        guard.transaction(
            &Target::broadcast(),
            &mut [
                Step::Select,
                Step::Power {
                    byte: ds18s20::CONVERT_T,
                    delay: CONVERSION_TIME,
                },
                Step::End,
            ],
        )?;
        guard.bus.simultaneous = Some(Instant::now());
        debug!(bus = self.index, "simultaneous conversion done");
        Ok(())
    }
}

/// Exclusive access to a bus. Transactions run through a guard cannot be
/// interleaved with other users of the connection.
pub struct BusGuard<'a> {
    connection: &'a Connection,
    bus: MutexGuard<'a, Bus>,
    since: Instant,
}

impl BusGuard<'_> {
    pub fn transaction(&mut self, target: &Target, steps: &mut [Step<'_>]) -> Result<()> {
        self.run(|bus| {
            bus.switch_branch(target)?;
            bus.adapter.execute_transaction(target, steps)?;
            bus.branch = target.path.clone();
            Ok(())
        })
    }

    /// One search pass.
    pub fn search_next(&mut self, search: &mut DeviceSearch) -> Result<Option<Address>> {
        if search.is_exhausted() {
            return Ok(None);
        }
        self.run(|bus| {
            bus.switch_branch(&Target::broadcast())?;
            bus.adapter.search_next(search)
        })
    }

    /// Run passes until the search is exhausted.
    pub fn search(&mut self, mode: SearchMode) -> Result<Vec<Address>> {
        let mut search = DeviceSearch::new(mode);
        let mut found = Vec::new();
        while let Some(address) = self.search_next(&mut search)? {
            found.push(address);
        }
        debug!(bus = self.connection.index, ?mode, count = found.len(), "search complete");
        Ok(found)
    }

    /// Whether a simultaneous conversion finished within `max_age`.
    pub fn simultaneous_fresh(&self, max_age: Duration) -> bool {
        self.bus
            .simultaneous
            .is_some_and(|done| done.elapsed() <= max_age)
    }

    pub fn adapter_name(&self) -> &str {
        self.bus.adapter.name()
    }

    /// Apply failure accounting around one operation.
    fn run<T>(&mut self, op: impl FnOnce(&mut Bus) -> Result<T>) -> Result<T> {
        let index = self.connection.index;
        let span = crate::tracing::bus_span(index, self.bus.adapter.name());
        let _entered = span.enter();
        self.connection.stats.lock().transactions += 1;
        if let Err(e) = self.bus.reconnect.check(index) {
            let mut stats = self.connection.stats.lock();
            stats.errors += 1;
            stats.rejected += 1;
            return Err(e);
        }

        match op(&mut self.bus) {
            Ok(value) => {
                self.bus.reconnect.succeeded();
                Ok(value)
            }
            Err(e) => {
                self.failed(&e);
                Err(e)
            }
        }
    }

    fn failed(&mut self, e: &Error) {
        let index = self.connection.index;
        {
            let mut stats = self.connection.stats.lock();
            stats.errors += 1;
            if matches!(e, Error::ChecksumMismatch { .. }) {
                stats.crc_errors += 1;
            }
        }
        if !e.is_transport() {
            return;
        }
        self.bus.branch = BusPath::default();

        if !self.bus.reconnect.failed() {
            error!(bus = index, failures = self.bus.reconnect.failures(), error = %e, "bus marked bad");
            return;
        }
        warn!(bus = index, failures = self.bus.reconnect.failures(), error = %e, "transport failure, reconnecting");
        self.connection.stats.lock().reconnects += 1;
        match self.bus.adapter.reconnect() {
            Ok(()) => {
                self.bus.reconnect.reconnected();
                info!(bus = index, "reconnected");
            }
            Err(re) => {
                self.connection.stats.lock().reconnect_errors += 1;
                self.bus.reconnect.reconnect_failed();
                error!(bus = index, error = %re, "reconnect failed, bus marked bad");
            }
        }
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        let mut stats = self.connection.stats.lock();
        stats.unlocks += 1;
        stats.busy_time += self.since.elapsed();
    }
}

/// Held while a multi-step operation on one device is in progress.
pub struct DeviceLock<'a> {
    connection: &'a Connection,
    address: Address,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for DeviceLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Prune the entry once nobody else holds or waits for it.
        let mut tree = self.connection.devices.lock();
        if tree
            .get(&self.address)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            tree.remove(&self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeDevice, FakeHandle};
    use std::thread;

    fn sensor(serial: u8) -> FakeDevice {
        FakeDevice::new(Address::from_family_serial(ds18s20::FAMILY, [serial, 0, 0, 0, 0, 0]))
    }

    fn connection(devices: Vec<FakeDevice>, limit: u32) -> (Connection, FakeHandle) {
        let adapter = FakeAdapter::new(devices);
        let handle = adapter.handle();
        let transport = Transport::Fake { devices: vec![] };
        (Connection::new(0, transport, Box::new(adapter), limit).unwrap(), handle)
    }

    fn read_scratchpad(connection: &Connection, address: Address) -> Result<[u8; 9]> {
        let mut data = [0u8; 9];
        connection.transaction(
            &Target::device(address),
            &mut [
                Step::Select,
                Step::Write(&[ds18s20::READ_SCRATCHPAD]),
                Step::Read(&mut data),
                Step::Crc8,
                Step::End,
            ],
        )?;
        Ok(data)
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let adapter = FakeAdapter::new(vec![]);
        let transport = Transport::Server {
            host: "localhost".into(),
            service: "4304".into(),
        };
        assert!(matches!(
            Connection::new(0, transport, Box::new(adapter), 3),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_transaction_counts() {
        let device = sensor(1);
        let address = device.address();
        let (connection, _) = connection(vec![device], 3);

        read_scratchpad(&connection, address).unwrap();
        let stats = connection.stats();
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.locks, 1);
        assert_eq!(stats.unlocks, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_crc_error_does_not_reconnect() {
        let device = sensor(1);
        let address = device.address();
        let (connection, handle) = connection(vec![device], 3);

        handle.corrupt_next_read();
        assert!(matches!(
            read_scratchpad(&connection, address),
            Err(Error::ChecksumMismatch { .. })
        ));
        let stats = connection.stats();
        assert_eq!(stats.crc_errors, 1);
        assert_eq!(stats.reconnects, 0);
        assert_eq!(connection.state(), ReconnectState::Ok);
    }

    #[test]
    fn test_transport_failure_reconnects() {
        let device = sensor(1);
        let address = device.address();
        let (connection, handle) = connection(vec![device], 3);

        handle.fail_operations(1);
        assert!(read_scratchpad(&connection, address).unwrap_err().is_transport());
        assert_eq!(connection.stats().reconnects, 1);
        assert_eq!(connection.state(), ReconnectState::Ok);

        read_scratchpad(&connection, address).unwrap();
    }

    #[test]
    fn test_failed_reconnect_marks_bad() {
        let device = sensor(1);
        let address = device.address();
        let (connection, handle) = connection(vec![device], 3);

        handle.fail_operations(1);
        handle.fail_detect(true);
        assert!(read_scratchpad(&connection, address).unwrap_err().is_transport());
        assert_eq!(connection.state(), ReconnectState::Bad);
        assert_eq!(connection.stats().reconnect_errors, 1);

        let operations = handle.operations();
        assert!(matches!(
            read_scratchpad(&connection, address),
            Err(Error::PermanentFailure(0))
        ));
        assert_eq!(handle.operations(), operations);
        assert_eq!(connection.stats().reconnects, 1);
    }

    #[test]
    fn test_rejected_request_is_counted() {
        let device = sensor(1);
        let address = device.address();
        let (connection, handle) = connection(vec![device], 1);

        handle.fail_operations(1);
        assert!(read_scratchpad(&connection, address).is_err());
        let before = connection.stats();

        assert!(matches!(
            read_scratchpad(&connection, address),
            Err(Error::PermanentFailure(_))
        ));
        let after = connection.stats();
        assert_eq!(after.transactions, before.transactions + 1);
        assert_eq!(after.errors, before.errors + 1);
        assert_eq!(after.rejected, 1);
        assert_eq!(after.locks, after.unlocks);
    }

    #[test]
    fn test_guard_chains_transactions() {
        let device = sensor(1);
        let address = device.address();
        let (connection, _) = connection(vec![device], 3);

        let mut guard = connection.lock();
        let mut first = [0u8; 9];
        let mut second = [0u8; 9];
        guard
            .transaction(
                &Target::device(address),
                &mut [Step::Select, Step::Write(&[ds18s20::READ_SCRATCHPAD]), Step::Read(&mut first)],
            )
            .unwrap();
        guard
            .transaction(
                &Target::device(address),
                &mut [Step::Select, Step::Write(&[ds18s20::READ_SCRATCHPAD]), Step::Read(&mut second)],
            )
            .unwrap();
        drop(guard);

        assert_eq!(first, second);
        let stats = connection.stats();
        assert_eq!(stats.locks, 1);
        assert_eq!(stats.transactions, 2);
    }

    #[test]
    fn test_search_under_lock() {
        let (connection, _) = connection(vec![sensor(1), sensor(2), sensor(3)], 3);
        assert_eq!(connection.search(SearchMode::Normal).unwrap().len(), 3);
        // Three finds plus nothing further: the last pass knew it was last.
        assert_eq!(connection.stats().transactions, 3);
    }

    #[test]
    fn test_device_lock_tree_is_pruned() {
        let (connection, _) = connection(vec![], 3);
        let address = Address::from_family_serial(0x10, [1, 0, 0, 0, 0, 0]);
        {
            let _lock = connection.lock_device(address);
            assert_eq!(connection.devices.lock().len(), 1);
        }
        assert!(connection.devices.lock().is_empty());
    }

    #[test]
    fn test_device_lock_serialises_threads() {
        let (connection, _) = connection(vec![], 3);
        let connection = Arc::new(connection);
        let address = Address::from_family_serial(0x10, [1, 0, 0, 0, 0, 0]);
        let counter = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..4)
            .map(|n| {
                let connection = Arc::clone(&connection);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _lock = connection.lock_device(address);
                    counter.lock().push(n);
                    thread::sleep(Duration::from_millis(2));
                    counter.lock().push(n);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let order = counter.lock().clone();
        for pair in order.chunks(2) {
            assert_eq!(pair[0], pair[1], "device lock let two holders overlap");
        }
    }

    #[test]
    fn test_simultaneous_latch() {
        let (connection, _) = connection(vec![sensor(1), sensor(2)], 3);
        assert!(!connection.lock().simultaneous_fresh(Duration::from_secs(10)));
        connection.trigger_simultaneous_temperature().unwrap();
        assert!(connection.lock().simultaneous_fresh(Duration::from_secs(10)));
    }

    #[test]
    fn test_redetect_recovers_bad_bus() {
        let device = sensor(1);
        let address = device.address();
        let (connection, handle) = connection(vec![device], 1);

        handle.fail_operations(1);
        assert!(read_scratchpad(&connection, address).is_err());
        assert_eq!(connection.state(), ReconnectState::Bad);

        connection.redetect().unwrap();
        assert_eq!(connection.state(), ReconnectState::Ok);
        read_scratchpad(&connection, address).unwrap();
    }
}
