//! DS18S20 high-precision thermometer.

use std::time::Duration;

use super::{CacheClass, DeviceFamily, DeviceKind, Format, Property, Query, Size, Value};
use crate::connection::CONVERSION_TIME;
use crate::error::{Error, Result};
use crate::transaction::Step;

pub const FAMILY: u8 = 0x10;

pub const CONVERT_T: u8 = 0x44;
pub const READ_SCRATCHPAD: u8 = 0xBE;
pub const WRITE_SCRATCHPAD: u8 = 0x4E;
pub const COPY_SCRATCHPAD: u8 = 0x48;
pub const READ_POWER_SUPPLY: u8 = 0xB4;

const SCRATCHPAD_LENGTH: usize = 9;
/// EEPROM write time after Copy Scratchpad
const COPY_TIME: Duration = Duration::from_millis(10);
/// How long a bus-wide conversion stands in for a per-device one
const SIMULTANEOUS_VALIDITY: Duration = Duration::from_secs(5);

const SCRATCHPAD: &str = "scratchpad";

const PROPERTIES: &[Property] = &[
    Property::new(SCRATCHPAD, Size::Fixed(SCRATCHPAD_LENGTH), Format::Binary, CacheClass::Volatile)
        .reads(read_scratchpad),
    Property::new("temperature", Size::Fixed(12), Format::Temperature, CacheClass::Simultaneous)
        .reads(read_temperature),
    Property::new("power", Size::Fixed(1), Format::YesNo, CacheClass::Volatile).reads(read_power),
    Property::new("temphigh", Size::Fixed(12), Format::Temperature, CacheClass::Stable)
        .reads(read_temphigh)
        .writes(write_temphigh),
    Property::new("templow", Size::Fixed(12), Format::Temperature, CacheClass::Stable)
        .reads(read_templow)
        .writes(write_templow),
];

inventory::submit! {
    DeviceFamily {
        code: FAMILY,
        name: "DS18S20",
        kind: DeviceKind::Chip,
        properties: PROPERTIES,
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

/// Temperature with the COUNT_REMAIN extension:
/// `T = TEMP_READ - 0.25 + (COUNT_PER_C - COUNT_REMAIN) / COUNT_PER_C`.
pub fn decode_temperature(pad: &[u8]) -> Result<f64> {
    let [lsb, msb, _, _, _, _, count_remain, count_per_c, ..] = *pad else {
        return Err(Error::ProtocolViolation(format!(
            "scratchpad of {} bytes",
            pad.len()
        )));
    };
    // Drop the half-degree bit; the counters supply a finer fraction.
    let whole = f64::from(i16::from_le_bytes([lsb, msb]) >> 1);
    if count_per_c == 0 {
        return Err(Error::ProtocolViolation(
            "COUNT_PER_C is zero".to_string(),
        ));
    }
    let per_c = f64::from(count_per_c);
    Ok(whole - 0.25 + (per_c - f64::from(count_remain)) / per_c)
}

fn read_temperature(q: &mut Query<'_>) -> Result<Value> {
    let fresh = q.lock().simultaneous_fresh(SIMULTANEOUS_VALIDITY);
    if !fresh {
        q.transaction(&mut [
            Step::Select,
            Step::Power {
                byte: CONVERT_T,
                delay: CONVERSION_TIME,
            },
            Step::End,
        ])?;
        q.invalidate_sibling(SCRATCHPAD)?;
    }
    let pad = q.sibling_bytes(SCRATCHPAD, SCRATCHPAD_LENGTH)?;
    Ok(Value::Temperature(decode_temperature(&pad)?))
}

/// Yes when the sensor has its own supply; parasite-powered parts pull
/// the bus low in the read slot.
fn read_power(q: &mut Query<'_>) -> Result<Value> {
    let mut answer = [0u8; 1];
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[READ_POWER_SUPPLY]),
        Step::Read(&mut answer),
        Step::End,
    ])?;
    Ok(Value::YesNo(answer[0] != 0))
}

fn read_threshold(q: &mut Query<'_>, offset: usize) -> Result<Value> {
    let pad = q.sibling_bytes(SCRATCHPAD, SCRATCHPAD_LENGTH)?;
    Ok(Value::Temperature(f64::from(pad[offset] as i8)))
}

fn read_temphigh(q: &mut Query<'_>) -> Result<Value> {
    read_threshold(q, 2)
}

fn read_templow(q: &mut Query<'_>) -> Result<Value> {
    read_threshold(q, 3)
}

fn write_temphigh(q: &mut Query<'_>, value: &Value) -> Result<()> {
    write_threshold(q, value, 2)
}

fn write_templow(q: &mut Query<'_>, value: &Value) -> Result<()> {
    write_threshold(q, value, 3)
}

/// Replace one alarm threshold, keep the other, and store both in EEPROM.
fn write_threshold(q: &mut Query<'_>, value: &Value, offset: usize) -> Result<()> {
    let property = q.property().name;
    let celsius = value.as_f64().ok_or_else(|| Error::InvalidValue {
        property,
        reason: format!("{value} is not a temperature"),
    })?;
    if !(-55.0..=125.0).contains(&celsius) {
        return Err(Error::InvalidValue {
            property,
            reason: format!("{celsius} C is outside -55..125"),
        });
    }

    let pad = q.sibling_bytes(SCRATCHPAD, SCRATCHPAD_LENGTH)?;
    let mut thresholds = [pad[2], pad[3]];
    thresholds[offset - 2] = celsius.round() as i8 as u8;

    {
        let mut bus = q.lock();
        bus.transaction(
            q.target(),
            &mut [
                Step::Select,
                Step::Write(&[WRITE_SCRATCHPAD, thresholds[0], thresholds[1]]),
                Step::End,
            ],
        )?;
        bus.transaction(
            q.target(),
            &mut [
                Step::Select,
                Step::Power {
                    byte: COPY_SCRATCHPAD,
                    delay: COPY_TIME,
                },
                Step::End,
            ],
        )?;
    }
    q.invalidate_sibling(SCRATCHPAD)
}
