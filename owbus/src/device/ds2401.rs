//! DS2401 silicon serial number, with the TSH202 humidity and temperature
//! extension that answers on the same family code, and the DS1420 ROM.

use super::{CacheClass, DeviceFamily, DeviceKind, Format, Property, Query, Size, Value};
use crate::error::{Error, Result};
use crate::transaction::Step;

pub const FAMILY: u8 = 0x01;
pub const DS1420_FAMILY: u8 = 0x81;

pub const READ_SCRATCHPAD: u8 = 0xBE;
pub const WRITE_SCRATCHPAD: u8 = 0x4E;
pub const READ_FUNCTIONAL_REGISTER: u8 = 0x93;

const SCRATCHPAD_LENGTH: usize = 9;
const REGISTER_LENGTH: usize = 4;
/// Resolution of the temperature and humidity words
const LSB: f64 = 0.0625;

const SCRATCHPAD: &str = "TSH202/scratchpad";
const REGISTER: &str = "TSH202/functional_register";

const PROPERTIES: &[Property] = &[
    Property::subdir("TSH202"),
    Property::new(SCRATCHPAD, Size::Fixed(SCRATCHPAD_LENGTH), Format::Binary, CacheClass::Volatile)
        .reads(read_scratchpad)
        .writes(write_scratchpad),
    Property::new("TSH202/temperature", Size::Fixed(12), Format::Temperature, CacheClass::Simultaneous)
        .reads(read_temperature),
    Property::new("TSH202/humidity", Size::Fixed(12), Format::Float, CacheClass::Volatile)
        .reads(read_humidity),
    Property::new(REGISTER, Size::Fixed(REGISTER_LENGTH), Format::Binary, CacheClass::Volatile)
        .reads(read_functional_register),
    Property::new("TSH202/firmware_version", Size::Fixed(7), Format::Ascii, CacheClass::Static)
        .reads(read_firmware_version),
    Property::new("TSH202/sub_family_code", Size::Variable, Format::Ascii, CacheClass::Static)
        .reads(read_sub_family_code),
];

inventory::submit! {
    DeviceFamily {
        code: FAMILY,
        name: "DS2401",
        kind: DeviceKind::Chip,
        properties: PROPERTIES,
    }
}

inventory::submit! {
    DeviceFamily {
        code: DS1420_FAMILY,
        name: "DS1420",
        kind: DeviceKind::Chip,
        properties: &[],
    }
}

fn read_scratchpad(q: &mut Query<'_>) -> Result<Value> {
    let mut data = [0u8; SCRATCHPAD_LENGTH];
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[READ_SCRATCHPAD]),
        Step::Read(&mut data),
        Step::Crc8,
        Step::End,
    ])?;
    Ok(Value::Binary(data.to_vec()))
}

/// Two bytes of user data go into scratchpad bytes 4 and 5.
fn write_scratchpad(q: &mut Query<'_>, value: &Value) -> Result<()> {
    let bytes = match value.as_bytes() {
        Some(&[first, second]) => [first, second],
        _ => {
            return Err(Error::InvalidValue {
                property: SCRATCHPAD,
                reason: "expected exactly 2 bytes".to_string(),
            })
        }
    };
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[WRITE_SCRATCHPAD, bytes[0], bytes[1]]),
        Step::End,
    ])?;
    q.invalidate_sibling(SCRATCHPAD)
}

fn read_temperature(q: &mut Query<'_>) -> Result<Value> {
    let pad = q.sibling_bytes(SCRATCHPAD, SCRATCHPAD_LENGTH)?;
    let raw = i16::from_le_bytes([pad[2], pad[3]]);
    Ok(Value::Temperature(f64::from(raw) * LSB))
}

fn read_humidity(q: &mut Query<'_>) -> Result<Value> {
    let pad = q.sibling_bytes(SCRATCHPAD, SCRATCHPAD_LENGTH)?;
    let raw = i16::from_le_bytes([pad[0], pad[1]]);
    Ok(Value::Float(f64::from(raw) * LSB))
}

fn read_functional_register(q: &mut Query<'_>) -> Result<Value> {
    let mut data = [0u8; REGISTER_LENGTH];
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[READ_FUNCTIONAL_REGISTER]),
        Step::Read(&mut data),
        Step::End,
    ])?;
    Ok(Value::Binary(data.to_vec()))
}

fn read_firmware_version(q: &mut Query<'_>) -> Result<Value> {
    let register = q.sibling_bytes(REGISTER, REGISTER_LENGTH)?;
    Ok(Value::Ascii(format!("{:3}.{:3}", register[0], register[1])))
}

fn read_sub_family_code(q: &mut Query<'_>) -> Result<Value> {
    let register = q.sibling_bytes(REGISTER, REGISTER_LENGTH)?;
    Ok(Value::Ascii(format!("0x{:X}", register[3])))
}
