//! DS2413 dual-channel addressable switch.

use super::{
    Aggregate, CacheClass, DeviceFamily, DeviceKind, Format, Layout, Naming, Property, Query, Size,
    Value,
};
use crate::error::{Error, Result};
use crate::transaction::Step;

pub const FAMILY: u8 = 0x3A;

pub const PIO_ACCESS_READ: u8 = 0xF5;
pub const PIO_ACCESS_WRITE: u8 = 0x5A;
pub const WRITE_CONFIRM: u8 = 0xAA;

const CHANNELS: usize = 2;
const CHANNEL_PAIR: Aggregate = Aggregate::new(CHANNELS, Naming::Letters, Layout::Packed);
const STATUS: &str = "status";

const PROPERTIES: &[Property] = &[
    Property::new(STATUS, Size::Fixed(1), Format::Binary, CacheClass::Volatile)
        .reads(read_status)
        .hidden(),
    Property::new("sensed", Size::Fixed(1), Format::YesNo, CacheClass::Volatile)
        .aggregate(CHANNEL_PAIR)
        .reads(read_sensed),
    Property::new("latch", Size::Fixed(1), Format::YesNo, CacheClass::Volatile)
        .aggregate(CHANNEL_PAIR)
        .reads(read_latch),
    Property::new("PIO", Size::Fixed(1), Format::YesNo, CacheClass::Stable)
        .aggregate(CHANNEL_PAIR)
        .reads(read_pio)
        .writes(write_pio),
];

inventory::submit! {
    DeviceFamily {
        code: FAMILY,
        name: "DS2413",
        kind: DeviceKind::Chip,
        properties: PROPERTIES,
    }
}

/// Low nibble of a PIO access status byte, checked against its complement.
fn checked_status(byte: u8) -> Result<u8> {
    let low = byte & 0x0F;
    if byte >> 4 != !low & 0x0F {
        return Err(Error::ProtocolViolation(format!(
            "PIO status {byte:#04X} fails its complement check"
        )));
    }
    Ok(low)
}

fn read_status(q: &mut Query<'_>) -> Result<Value> {
    let mut status = [0u8; 1];
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[PIO_ACCESS_READ]),
        Step::Read(&mut status),
        Step::End,
    ])?;
    checked_status(status[0])?;
    Ok(Value::Binary(status.to_vec()))
}

/// Status bits: PIOA pin, PIOA latch, PIOB pin, PIOB latch.
fn status_bits(q: &mut Query<'_>) -> Result<u8> {
    let status = q.sibling_bytes(STATUS, 1)?;
    checked_status(status[0])
}

fn channels(status: u8, shift: u8, invert: bool) -> Value {
    Value::Array(
        (0..CHANNELS as u8)
            .map(|channel| Value::YesNo((status >> (channel * 2 + shift) & 1 == 1) != invert))
            .collect(),
    )
}

fn read_sensed(q: &mut Query<'_>) -> Result<Value> {
    Ok(channels(status_bits(q)?, 0, false))
}

fn read_latch(q: &mut Query<'_>) -> Result<Value> {
    Ok(channels(status_bits(q)?, 1, false))
}

/// Yes means the output transistor conducts, i.e. the latch is low.
fn read_pio(q: &mut Query<'_>) -> Result<Value> {
    Ok(channels(status_bits(q)?, 1, true))
}

fn write_pio(q: &mut Query<'_>, value: &Value) -> Result<()> {
    let on: Vec<bool> = value
        .as_array()
        .map(|elements| elements.iter().filter_map(Value::as_bool).collect())
        .unwrap_or_default();
    if on.len() != CHANNELS {
        return Err(Error::InvalidValue {
            property: q.property().name,
            reason: format!("expected {CHANNELS} yes/no values, got {value}"),
        });
    }
    // Unused bits must be 1; a 1 bit switches the transistor off.
    let data = 0xFC | u8::from(!on[0]) | u8::from(!on[1]) << 1;

    let mut confirm = [0u8; 2];
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[PIO_ACCESS_WRITE, data, !data]),
        Step::Read(&mut confirm),
        Step::End,
    ])?;
    if confirm[0] != WRITE_CONFIRM {
        return Err(Error::ProtocolViolation(format!(
            "PIO write not confirmed ({:#04X})",
            confirm[0]
        )));
    }
    checked_status(confirm[1])?;
    q.invalidate_sibling(STATUS)
}
