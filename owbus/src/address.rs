//! Device ROM addresses.
//!
//! Every device on a 1-Wire bus carries a 64-bit ROM code: one family byte,
//! a 48-bit serial number, and a CRC8 over the first seven bytes. Bytes are
//! stored in bus order (family first), and bits within a byte go out LSB
//! first, which is also the order the search algorithm resolves them in.

use bitvec::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::crc::crc8;
use crate::error::Error;

/// Number of address bits resolved by a search pass.
pub const ADDRESS_BITS: usize = 64;

/// A 64-bit 1-Wire ROM code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address([u8; 8]);

impl Address {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Build an address from family and serial, computing the CRC byte.
    pub fn from_family_serial(family: u8, serial: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[0] = family;
        bytes[1..7].copy_from_slice(&serial);
        bytes[7] = crc8(&bytes[..7]);
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    pub fn serial(&self) -> [u8; 6] {
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&self.0[1..7]);
        serial
    }

    pub fn crc(&self) -> u8 {
        self.0[7]
    }

    /// CRC byte matches the other 56 bits.
    pub fn is_valid(&self) -> bool {
        crc8(&self.0) == 0
    }

    /// Address bit `index`, in bus order.
    pub fn bit(&self, index: usize) -> bool {
        self.0.view_bits::<Lsb0>()[index]
    }

    pub fn set_bit(&mut self, index: usize, value: bool) {
        self.0.view_bits_mut::<Lsb0>().set(index, value);
    }

    /// Upper-case hex of all eight bytes in bus order.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Upper-case hex of all eight bytes, CRC first.
    pub fn to_reversed_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode_upper(reversed)
    }
}

impl From<[u8; 8]> for Address {
    fn from(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{}", self.0[0], hex::encode_upper(&self.0[1..7]))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self}.{:02X})", self.0[7])
    }
}

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([0-9A-Fa-f]{2})\.?([0-9A-Fa-f]{12})(?:\.?([0-9A-Fa-f]{2}))?$")
            .expect("address pattern is a valid regex")
    })
}

impl FromStr for Address {
    type Err = Error;

    /// Accepts `FF.SSSSSSSSSSSS`, `FFSSSSSSSSSSSS`, and either with a
    /// trailing CRC byte (`.CC` or `CC`), which must then be correct.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = address_pattern()
            .captures(s)
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;

        let family = u8::from_str_radix(&caps[1], 16)
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let mut serial = [0u8; 6];
        hex::decode_to_slice(&caps[2], &mut serial)
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;

        let address = Self::from_family_serial(family, serial);
        if let Some(crc) = caps.get(3) {
            let crc = u8::from_str_radix(crc.as_str(), 16)
                .map_err(|_| Error::InvalidAddress(s.to_string()))?;
            if crc != address.crc() {
                return Err(Error::InvalidAddress(format!(
                    "{s}: CRC should be {:02X}",
                    address.crc()
                )));
            }
        }
        Ok(address)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
