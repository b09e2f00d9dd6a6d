//! Device enumeration.
//!
//! The 1-Wire search walks a binary tree of ROM codes one bit at a time.
//! For each bit every participating device sends its bit and then the
//! complement; the wired-AND of those tells the master whether all devices
//! agree or whether there is a discrepancy. The master picks a direction and
//! writes it back, and devices that disagree drop out until the next reset.
//!
//! [`DeviceSearch`] is the per-enumeration state: the last address found and
//! the deepest bit where this pass chose 0 at a discrepancy. Adapters drive
//! the bus and feed the bits in; adapters with a hardware "triplet" use the
//! same bookkeeping.

use crate::adapter::{rom, write_verified, Adapter, Presence};
use crate::address::{Address, ADDRESS_BITS};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transaction::StepKind;

/// Which devices take part in a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    Normal,
    /// Only devices with an alarm condition answer
    Alarm,
    /// Only devices of this family are reported
    Family(u8),
}

impl SearchMode {
    /// ROM command that starts a pass.
    pub fn command(self) -> u8 {
        match self {
            SearchMode::Alarm => rom::ALARM_SEARCH,
            SearchMode::Normal | SearchMode::Family(_) => rom::SEARCH,
        }
    }
}

/// State carried between search passes.
///
/// Each enumeration owns one; nothing here is shared between callers.
#[derive(Debug, Clone)]
pub struct DeviceSearch {
    mode: SearchMode,
    address: Address,
    last_discrepancy: Option<usize>,
    last_device: bool,
    started: bool,
}

impl DeviceSearch {
    pub fn new(mode: SearchMode) -> Self {
        Self {
            mode,
            address: Address::default(),
            last_discrepancy: None,
            last_device: false,
            started: false,
        }
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    /// Address found by the latest pass.
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn last_discrepancy(&self) -> Option<usize> {
        self.last_discrepancy
    }

    /// No further pass will find anything.
    pub fn is_exhausted(&self) -> bool {
        self.last_device
    }

    /// Prepare for a pass. Returns false when the search is already
    /// exhausted, in which case the bus must not be touched.
    pub fn begin_pass(&mut self) -> bool {
        if self.last_device {
            return false;
        }
        if !self.started {
            self.started = true;
            self.address = Address::default();
            self.last_discrepancy = None;
            if let SearchMode::Family(family) = self.mode {
                // Seed the family byte and pretend every bit below 64 was
                // already explored, so the first pass follows the seed.
                self.address = Address::new([family, 0, 0, 0, 0, 0, 0, 0]);
                self.last_discrepancy = Some(ADDRESS_BITS);
            }
        }
        true
    }

    /// Mark the search exhausted, e.g. after a reset with no presence.
    pub fn exhaust(&mut self) {
        self.last_device = true;
    }

    /// Direction to take at `bit` if the devices disagree there.
    pub fn preferred(&self, bit: usize) -> bool {
        match self.last_discrepancy {
            Some(last) if bit < last => self.address.bit(bit),
            Some(last) if bit == last => true,
            _ => false,
        }
    }

    /// Record the answer for `bit` and return the direction to write back.
    ///
    /// `id` and `complement` are the wired-AND of what the devices sent.
    /// `pass_zero` collects the deepest bit where this pass took 0 at a
    /// discrepancy. Returns `None` when no device answered the first bit,
    /// which ends the search without error.
    pub fn resolve(
        &mut self,
        bit: usize,
        id: bool,
        complement: bool,
        pass_zero: &mut Option<usize>,
    ) -> Result<Option<bool>> {
        let direction = match (id, complement) {
            (true, true) if bit == 0 => {
                self.last_device = true;
                return Ok(None);
            }
            (true, true) => {
                self.last_device = true;
                return Err(Error::ProtocolViolation(format!(
                    "no device answered search bit {bit}"
                )));
            }
            (false, false) => {
                let direction = self.preferred(bit);
                if !direction {
                    *pass_zero = Some(bit);
                }
                direction
            }
            (id, _) => id,
        };
        self.address.set_bit(bit, direction);
        Ok(Some(direction))
    }

    /// Close a pass whose 64 bits were all resolved.
    pub fn finish_pass(&mut self, pass_zero: Option<usize>) -> Result<Option<Address>> {
        if !self.address.is_valid() {
            self.last_device = true;
            return Err(Error::ProtocolViolation(format!(
                "search found {:?} with a bad CRC",
                self.address
            )));
        }
        if let SearchMode::Family(family) = self.mode {
            if self.address.family() != family {
                self.last_device = true;
                return Ok(None);
            }
        }
        self.last_discrepancy = pass_zero;
        if pass_zero.is_none() {
            self.last_device = true;
        }
        Ok(Some(self.address))
    }
}

/// One search pass using plain bit I/O: two read slots and one write slot
/// per address bit.
pub fn next_by_bits<A: Adapter + ?Sized>(
    adapter: &mut A,
    search: &mut DeviceSearch,
) -> Result<Option<Address>> {
    if !search.begin_pass() {
        return Ok(None);
    }
    if adapter.reset()? == Presence::Empty {
        search.exhaust();
        return Ok(None);
    }
    write_verified(adapter, &[search.mode().command()], StepKind::Write)?;

    let mut pass_zero = None;
    for bit in 0..ADDRESS_BITS {
        let mut answer = [false; 2];
        adapter.sendback_bits(&[true, true], &mut answer)?;
        let Some(direction) = search.resolve(bit, answer[0], answer[1], &mut pass_zero)? else {
            return Ok(None);
        };
        let mut echo = [false];
        adapter.sendback_bits(&[direction], &mut echo)?;
    }

    let found = search.finish_pass(pass_zero)?;
    if let Some(address) = found {
        trace!(device = %address, "search pass");
    }
    Ok(found)
}

/// Confirm `address` answers a search (alarm search for `SearchMode::Alarm`)
/// by walking its own bits and checking no answer contradicts them.
pub fn verify<A: Adapter + ?Sized>(
    adapter: &mut A,
    address: Address,
    mode: SearchMode,
) -> Result<bool> {
    if adapter.reset()? == Presence::Empty {
        return Ok(false);
    }
    write_verified(adapter, &[mode.command()], StepKind::Verify)?;

    for bit in 0..ADDRESS_BITS {
        let mut answer = [false; 2];
        adapter.sendback_bits(&[true, true], &mut answer)?;
        let wanted = address.bit(bit);
        let contradicted = match (answer[0], answer[1]) {
            (true, true) => true,
            (id, complement) => (wanted && complement) || (!wanted && id),
        };
        if contradicted {
            return Ok(false);
        }
        let mut echo = [false];
        adapter.sendback_bits(&[wanted], &mut echo)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeDevice};

    fn devices(addresses: &[Address]) -> Vec<FakeDevice> {
        addresses.iter().copied().map(FakeDevice::new).collect()
    }

    fn enumerate(adapter: &mut FakeAdapter, mode: SearchMode) -> Vec<Address> {
        let mut search = DeviceSearch::new(mode);
        let mut found = Vec::new();
        while let Some(address) = adapter.search_next(&mut search).unwrap() {
            found.push(address);
            assert!(found.len() <= 64, "search did not terminate");
        }
        found
    }

    #[test]
    fn test_preferred_direction() {
        let mut search = DeviceSearch::new(SearchMode::Normal);
        assert!(search.begin_pass());
        assert!(!search.preferred(3));

        search.address = Address::new([0b0000_0100, 0, 0, 0, 0, 0, 0, 0]);
        search.last_discrepancy = Some(5);
        assert!(search.preferred(2), "below: follow previous address");
        assert!(!search.preferred(3), "below: follow previous address");
        assert!(search.preferred(5), "at: take 1");
        assert!(!search.preferred(6), "above: take 0");
    }

    #[test]
    fn test_single_device() {
        let only = Address::from_family_serial(0x28, [0xAA, 0xBB, 0xCC, 0, 0, 1]);
        let mut adapter = FakeAdapter::new(devices(&[only]));
        assert_eq!(enumerate(&mut adapter, SearchMode::Normal), vec![only]);
    }

    #[test]
    fn test_enumerates_each_device_once() {
        let addresses: Vec<Address> = [
            (0x10, [0x01, 0, 0, 0, 0, 0]),
            (0x10, [0x02, 0, 0, 0, 0, 0]),
            (0x28, [0xFF, 0xFF, 0, 0, 0, 0]),
            (0x01, [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]),
            (0x2D, [0x80, 0, 0, 0, 0, 0x80]),
        ]
        .into_iter()
        .map(|(family, serial)| Address::from_family_serial(family, serial))
        .collect();
        let mut adapter = FakeAdapter::new(devices(&addresses));

        let mut found = enumerate(&mut adapter, SearchMode::Normal);
        let mut expected = addresses.clone();
        found.sort();
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_exhausted_search_does_not_touch_bus() {
        let only = Address::from_family_serial(0x28, [1, 0, 0, 0, 0, 0]);
        let mut adapter = FakeAdapter::new(devices(&[only]));
        let handle = adapter.handle();

        let mut search = DeviceSearch::new(SearchMode::Normal);
        assert_eq!(adapter.search_next(&mut search).unwrap(), Some(only));
        assert!(search.is_exhausted());

        let before = handle.operations();
        assert_eq!(adapter.search_next(&mut search).unwrap(), None);
        assert_eq!(handle.operations(), before);
    }

    #[test]
    fn test_empty_bus() {
        let mut adapter = FakeAdapter::new(vec![]);
        assert!(enumerate(&mut adapter, SearchMode::Normal).is_empty());
    }

    #[test]
    fn test_family_search() {
        let a = Address::from_family_serial(0x01, [0x11, 0, 0, 0, 0, 0]);
        let b = Address::from_family_serial(0x10, [0x22, 0, 0, 0, 0, 0]);
        let c = Address::from_family_serial(0x01, [0x33, 0, 0, 0, 0, 0]);
        let mut adapter = FakeAdapter::new(devices(&[a, b, c]));

        let mut found = enumerate(&mut adapter, SearchMode::Family(0x01));
        found.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(found, expected);

        assert!(enumerate(&mut adapter, SearchMode::Family(0x3A)).is_empty());
    }

    #[test]
    fn test_alarm_search() {
        let quiet = Address::from_family_serial(0x10, [1, 0, 0, 0, 0, 0]);
        let loud = Address::from_family_serial(0x10, [2, 0, 0, 0, 0, 0]);
        let mut bus = devices(&[quiet, loud]);
        bus[1].set_alarm(true);
        let mut adapter = FakeAdapter::new(bus);

        assert_eq!(enumerate(&mut adapter, SearchMode::Alarm), vec![loud]);

        assert!(verify(&mut adapter, loud, SearchMode::Alarm).unwrap());
        assert!(!verify(&mut adapter, quiet, SearchMode::Alarm).unwrap());
        assert!(verify(&mut adapter, quiet, SearchMode::Normal).unwrap());
    }

    #[test]
    fn test_no_alarms_is_not_an_error() {
        let quiet = Address::from_family_serial(0x10, [1, 0, 0, 0, 0, 0]);
        let mut adapter = FakeAdapter::new(devices(&[quiet]));
        assert!(enumerate(&mut adapter, SearchMode::Alarm).is_empty());
    }

    #[test]
    fn test_bad_crc_is_protocol_violation() {
        let mut broken = Address::from_family_serial(0x10, [1, 0, 0, 0, 0, 0]);
        broken.set_bit(63, !broken.bit(63));
        let mut adapter = FakeAdapter::new(devices(&[broken]));

        let mut search = DeviceSearch::new(SearchMode::Normal);
        let err = adapter.search_next(&mut search).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(search.is_exhausted());
    }

    #[test]
    fn test_vanished_device_is_protocol_violation() {
        let mut search = DeviceSearch::new(SearchMode::Normal);
        assert!(search.begin_pass());
        let mut pass_zero = None;
        assert_eq!(search.resolve(0, false, true, &mut pass_zero).unwrap(), Some(false));
        assert!(matches!(
            search.resolve(1, true, true, &mut pass_zero),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
