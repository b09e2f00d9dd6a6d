//! Bus adapters.
//!
//! An adapter is whatever sits between this program and the 1-Wire wire: a
//! serial or USB bus master, an I2C bridge, a network server, or the
//! simulated bus used for testing. The [`Adapter`] trait is the fixed
//! capability set the rest of the crate relies on; everything above it
//! (transactions, search, properties) is transport-agnostic.
//!
//! Byte-level drivers for the serial, USB, parallel and network adapters are
//! external collaborators. They implement [`Adapter`] and are described on a
//! connection by the matching [`Transport`] variant.

pub mod ds2482;
pub mod fake;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum::{Display, EnumString, IntoStaticStr};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::search::{self, DeviceSearch};
use crate::transaction::{self, Step, StepKind, Target};

/// ROM (network layer) command codes.
pub mod rom {
    pub const SEARCH: u8 = 0xF0;
    pub const ALARM_SEARCH: u8 = 0xEC;
    pub const READ: u8 = 0x33;
    pub const MATCH: u8 = 0x55;
    pub const SKIP: u8 = 0xCC;
    pub const OVERDRIVE_SKIP: u8 = 0x3C;
    pub const OVERDRIVE_MATCH: u8 = 0x69;
}

/// DS2409 coupler commands used for branch selection.
pub mod coupler {
    pub const ALL_LINES_OFF: u8 = 0x66;
    pub const SMART_ON_MAIN: u8 = 0xCC;
    pub const SMART_ON_AUX: u8 = 0x33;
}

bitflags! {
    /// Static capabilities of an adapter variant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AdapterFlags: u32 {
        /// Can switch the bus to overdrive speed
        const OVERDRIVE = 0x0000_0001;
        /// DS2409 branch paths must be selected by the core
        const BRANCH_PATH = 0x0000_0010;
        /// Directory listings are fetched in bulk
        const DIR_GULP = 0x0000_0100;
    }
}

/// Adapter variants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// DS9097U / DS2480B serial bus master
    Serial,
    /// DS9097 passive serial adapter
    PassiveSerial,
    /// DS9490 USB adapter
    Usb,
    /// DS1410 parallel port adapter
    Parallel,
    /// DS2482-100/800 I2C bridge
    I2c,
    /// Remote owserver over TCP
    Server,
    /// Server found through service discovery
    Zeroconf,
    /// LINK adapter on a serial port
    Link,
    /// LINK adapter over the network
    LinkNet,
    /// HA7 network adapter
    Ha7,
    /// Simulated bus
    Fake,
}

/// 1-Wire bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusSpeed {
    #[default]
    Regular,
    Overdrive,
}

/// Outcome of a bus reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// At least one device answered with a presence pulse
    Devices,
    /// Nothing on the bus
    Empty,
}

/// Transport-specific state of a connection. Exactly one variant is
/// populated, matching the adapter kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    Serial {
        device: PathBuf,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    PassiveSerial {
        device: PathBuf,
    },
    Usb {
        bus_number: u32,
        /// DS1420 id burned into the adapter, used to find it again after
        /// it is unplugged and replugged.
        #[serde(default)]
        ds1420: Option<Address>,
    },
    Parallel {
        device: PathBuf,
    },
    I2c {
        device: PathBuf,
        i2c_address: u8,
        #[serde(default)]
        channel: u8,
    },
    Server {
        host: String,
        service: String,
    },
    Zeroconf {
        host: String,
        service: String,
        service_type: String,
        domain: String,
    },
    Link {
        device: PathBuf,
        #[serde(default = "default_baud")]
        baud: u32,
    },
    LinkNet {
        host: String,
        service: String,
    },
    Ha7 {
        host: String,
        service: String,
        #[serde(default)]
        lock: Option<String>,
    },
    Fake {
        #[serde(default)]
        devices: Vec<Address>,
    },
}

fn default_baud() -> u32 {
    9600
}

impl Transport {
    pub fn kind(&self) -> AdapterKind {
        match self {
            Self::Serial { .. } => AdapterKind::Serial,
            Self::PassiveSerial { .. } => AdapterKind::PassiveSerial,
            Self::Usb { .. } => AdapterKind::Usb,
            Self::Parallel { .. } => AdapterKind::Parallel,
            Self::I2c { .. } => AdapterKind::I2c,
            Self::Server { .. } => AdapterKind::Server,
            Self::Zeroconf { .. } => AdapterKind::Zeroconf,
            Self::Link { .. } => AdapterKind::Link,
            Self::LinkNet { .. } => AdapterKind::LinkNet,
            Self::Ha7 { .. } => AdapterKind::Ha7,
            Self::Fake { .. } => AdapterKind::Fake,
        }
    }

    /// Whether the bus is reached through another owserver rather than
    /// driven directly.
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Zeroconf { .. } | Self::Ha7 { .. } | Self::LinkNet { .. }
        )
    }
}

/// The capability set every bus adapter provides.
///
/// Methods with default bodies build on the primitive ones (`reset`,
/// `sendback_bytes`, `sendback_bits`); adapters with hardware support for a
/// composite operation override them.
pub trait Adapter: Send {
    fn kind(&self) -> AdapterKind;

    /// Human readable adapter model, e.g. "DS2482-800".
    fn name(&self) -> &str;

    fn flags(&self) -> AdapterFlags {
        AdapterFlags::empty()
    }

    /// Probe for the adapter and bring it to a usable state.
    fn detect(&mut self) -> Result<()>;

    /// Reset pulse; reports whether any device answered.
    fn reset(&mut self) -> Result<Presence>;

    /// Send `data` and receive the same number of bytes into `resp`.
    fn sendback_bytes(&mut self, data: &[u8], resp: &mut [u8]) -> Result<()>;

    /// Bit-at-a-time version of `sendback_bytes`. Sending a 1 is a read slot.
    fn sendback_bits(&mut self, bits: &[bool], resp: &mut [bool]) -> Result<()>;

    /// Release the transport.
    fn close(&mut self);

    fn speed(&self) -> BusSpeed {
        BusSpeed::Regular
    }

    fn set_overdrive(&mut self, speed: BusSpeed) -> Result<()> {
        match speed {
            BusSpeed::Regular => Ok(()),
            BusSpeed::Overdrive => Err(Error::Unsupported {
                capability: "overdrive",
                adapter: self.kind().into(),
            }),
        }
    }

    /// Whether devices answer at overdrive speed.
    fn probe_overdrive(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Clock in `buf.len()` bytes.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let ones = vec![0xFF; buf.len()];
        self.sendback_bytes(&ones, buf)
    }

    /// Send one byte, then hold the bus at strong pull-up for `delay`.
    ///
    /// Without a strong pull-up the best an adapter can do is wait with the
    /// bus idle high, which is enough for externally powered devices.
    fn power_byte(&mut self, byte: u8, delay: Duration) -> Result<u8> {
        let mut resp = [0u8; 1];
        self.sendback_bytes(&[byte], &mut resp)?;
        std::thread::sleep(delay);
        Ok(resp[0])
    }

    /// 12V programming pulse for EPROM devices.
    fn program_pulse(&mut self) -> Result<()> {
        Err(Error::Unsupported {
            capability: "program pulse",
            adapter: self.kind().into(),
        })
    }

    /// Reset the bus and address `target` (or every device).
    fn select(&mut self, target: &Target) -> Result<()> {
        select_by_bytes(self, target)
    }

    /// One step of the device search; `None` once the search is exhausted.
    fn search_next(&mut self, search: &mut DeviceSearch) -> Result<Option<Address>> {
        search::next_by_bits(self, search)
    }

    /// Close and reopen the transport.
    fn reconnect(&mut self) -> Result<()> {
        self.close();
        self.detect()
    }

    /// Run a transaction log. The caller holds the bus lock.
    fn execute_transaction(&mut self, target: &Target, steps: &mut [Step<'_>]) -> Result<()> {
        transaction::interpret(self, target, steps)
    }
}

/// Send `data` and require the bus to echo it unchanged.
pub fn write_verified<A: Adapter + ?Sized>(adapter: &mut A, data: &[u8], step: StepKind) -> Result<()> {
    let mut echo = vec![0u8; data.len()];
    adapter.sendback_bytes(data, &mut echo)?;
    if echo != data {
        return Err(Error::transport(
            step,
            format!("echo mismatch: sent {data:02X?}, read {echo:02X?}"),
        ));
    }
    Ok(())
}

/// Addressing with plain byte I/O: reset, walk the DS2409 branch path if
/// any, then Match ROM (or Skip ROM for a broadcast).
pub fn select_by_bytes<A: Adapter + ?Sized>(adapter: &mut A, target: &Target) -> Result<()> {
    if adapter.reset()? == Presence::Empty {
        return Err(Error::NotFound("no devices present on bus".to_string()));
    }

    let overdrive = adapter.speed() == BusSpeed::Overdrive;
    // Each smart-on resets the branch behind it, so later hops and the
    // target itself follow without another reset.
    for branch in target.path.branches() {
        let mut cmd = [0u8; 10];
        cmd[0] = rom::MATCH;
        cmd[1..9].copy_from_slice(branch.coupler.bytes());
        cmd[9] = branch.line.command();
        write_verified(adapter, &cmd, StepKind::Select)?;

        let mut resp = [0u8; 2];
        adapter.sendback_bytes(&[0xFF, 0xFF], &mut resp)?;
        if resp[1] != branch.line.command() {
            return Err(Error::transport(
                StepKind::Select,
                format!("coupler {} did not confirm branch", branch.coupler),
            ));
        }
    }

    match target.address {
        None => {
            let skip = if overdrive { rom::OVERDRIVE_SKIP } else { rom::SKIP };
            write_verified(adapter, &[skip], StepKind::Select)
        }
        Some(address) => {
            let mut cmd = [0u8; 9];
            cmd[0] = if overdrive { rom::OVERDRIVE_MATCH } else { rom::MATCH };
            cmd[1..].copy_from_slice(address.bytes());
            write_verified(adapter, &cmd, StepKind::Select)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_matches_variant() {
        let fake = Transport::Fake { devices: vec![] };
        assert_eq!(fake.kind(), AdapterKind::Fake);
        assert!(!fake.is_server());

        let ha7 = Transport::Ha7 {
            host: "ha7.local".into(),
            service: "80".into(),
            lock: None,
        };
        assert_eq!(ha7.kind(), AdapterKind::Ha7);
        assert!(ha7.is_server());
    }

    #[test]
    fn test_transport_from_toml() {
        let transport: Transport = toml::from_str(
            r#"
            kind = "i2c"
            device = "/dev/i2c-1"
            i2c_address = 0x18
            channel = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            transport,
            Transport::I2c {
                device: "/dev/i2c-1".into(),
                i2c_address: 0x18,
                channel: 3,
            }
        );

        let serial: Transport = toml::from_str("kind = \"serial\"\ndevice = \"/dev/ttyS0\"").unwrap();
        assert_eq!(
            serial,
            Transport::Serial {
                device: "/dev/ttyS0".into(),
                baud: 9600
            }
        );
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(AdapterKind::PassiveSerial.to_string(), "passive_serial");
        assert_eq!("ha7".parse::<AdapterKind>().unwrap(), AdapterKind::Ha7);
        let name: &'static str = AdapterKind::Fake.into();
        assert_eq!(name, "fake");
    }

    #[test]
    fn test_flags() {
        let flags = AdapterFlags::OVERDRIVE | AdapterFlags::DIR_GULP;
        assert!(flags.contains(AdapterFlags::OVERDRIVE));
        assert!(!flags.contains(AdapterFlags::BRANCH_PATH));
        assert_eq!(flags.bits(), 0x101);
    }
}
