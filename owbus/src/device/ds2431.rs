//! DS2431 1024-bit EEPROM.
//!
//! Memory is written one 8-byte row at a time through the scratchpad: write
//! the row with its target address, read the scratchpad back to confirm the
//! data and obtain the authorisation byte, then copy with the target address
//! and authorisation byte while the bus holds strong pull-up.

use std::time::Duration;

use super::{
    Aggregate, CacheClass, DeviceFamily, DeviceKind, Format, Layout, Naming, Property, Query, Size,
    Value,
};
use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::transaction::Step;

pub const FAMILY: u8 = 0x2D;

pub const READ_MEMORY: u8 = 0xF0;
pub const WRITE_SCRATCHPAD: u8 = 0x0F;
pub const READ_SCRATCHPAD: u8 = 0xAA;
pub const COPY_SCRATCHPAD: u8 = 0x55;
/// Alternating pattern the device sends once a copy completed
pub const COPY_DONE: u8 = 0xAA;

pub const MEMORY_SIZE: usize = 128;
pub const PAGE_SIZE: usize = 32;
pub const PAGES: usize = MEMORY_SIZE / PAGE_SIZE;
const ROW_SIZE: usize = 8;
/// tPROG
const PROGRAM_TIME: Duration = Duration::from_millis(10);

const PROPERTIES: &[Property] = &[
    Property::subdir("pages"),
    Property::new("pages/page", Size::Fixed(PAGE_SIZE), Format::Binary, CacheClass::Stable)
        .aggregate(Aggregate::new(PAGES, Naming::Numeric, Layout::Separate))
        .reads(read_page)
        .writes(write_page),
    Property::new("memory", Size::Fixed(MEMORY_SIZE), Format::Binary, CacheClass::Stable)
        .reads(read_memory)
        .writes(write_memory),
];

inventory::submit! {
    DeviceFamily {
        code: FAMILY,
        name: "DS2431",
        kind: DeviceKind::Chip,
        properties: PROPERTIES,
    }
}

fn read_page(q: &mut Query<'_>) -> Result<Value> {
    let page = q.element()?;
    Ok(Value::Binary(read_range(q, page * PAGE_SIZE, PAGE_SIZE)?))
}

fn read_memory(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Binary(read_range(q, 0, MEMORY_SIZE)?))
}

fn write_page(q: &mut Query<'_>, value: &Value) -> Result<()> {
    let page = q.element()?;
    let data = payload(q, value, PAGE_SIZE)?;
    write_range(q, page * PAGE_SIZE, data)
}

fn write_memory(q: &mut Query<'_>, value: &Value) -> Result<()> {
    let data = payload(q, value, MEMORY_SIZE)?;
    write_range(q, 0, data)
}

/// Binary data of at most `limit` bytes.
fn payload<'v>(q: &Query<'_>, value: &'v Value, limit: usize) -> Result<&'v [u8]> {
    match value.as_bytes() {
        Some(bytes) if !bytes.is_empty() && bytes.len() <= limit => Ok(bytes),
        _ => Err(Error::InvalidValue {
            property: q.property().name,
            reason: format!("expected 1 to {limit} bytes"),
        }),
    }
}

fn read_range(q: &mut Query<'_>, offset: usize, len: usize) -> Result<Vec<u8>> {
    let [lo, hi] = (offset as u16).to_le_bytes();
    let mut data = vec![0u8; len];
    q.transaction(&mut [
        Step::Select,
        Step::Write(&[READ_MEMORY, lo, hi]),
        Step::Read(&mut data),
        Step::End,
    ])?;
    Ok(data)
}

/// Write `data` at `offset`, filling partial rows from the current contents.
fn write_range(q: &mut Query<'_>, offset: usize, data: &[u8]) -> Result<()> {
    let end = offset + data.len();
    let first_row = offset / ROW_SIZE * ROW_SIZE;
    for row_start in (first_row..end).step_by(ROW_SIZE) {
        let row_end = row_start + ROW_SIZE;
        let mut row = [0u8; ROW_SIZE];
        if row_start < offset || row_end > end {
            row.copy_from_slice(&read_range(q, row_start, ROW_SIZE)?);
        }
        let from = row_start.max(offset);
        let to = row_end.min(end);
        row[from - row_start..to - row_start].copy_from_slice(&data[from - offset..to - offset]);
        write_row(q, row_start as u16, &row)?;
    }
    Ok(())
}

fn write_row(q: &mut Query<'_>, address: u16, row: &[u8; ROW_SIZE]) -> Result<()> {
    let [lo, hi] = address.to_le_bytes();
    let command = [WRITE_SCRATCHPAD, lo, hi];
    let mut sent = command.to_vec();
    sent.extend_from_slice(row);
    let mut crc = [0u8; 2];
    let mut frame = [0u8; 13];
    let mut done = [0u8; 1];

    let mut bus = q.lock();
    bus.transaction(
        q.target(),
        &mut [
            Step::Select,
            Step::Write(&command),
            Step::Write(row),
            Step::Read(&mut crc),
            Step::Crc16Seeded(crc16(&sent)),
            Step::End,
        ],
    )?;

    // TA1 TA2 E/S, the row, inverted CRC16.
    bus.transaction(
        q.target(),
        &mut [
            Step::Select,
            Step::Write(&[READ_SCRATCHPAD]),
            Step::Read(&mut frame),
            Step::Crc16Seeded(crc16(&[READ_SCRATCHPAD])),
            Step::End,
        ],
    )?;
    if frame[..2] != [lo, hi] || frame[3..11] != row[..] {
        return Err(Error::ProtocolViolation(format!(
            "scratchpad readback for row {address:#04X} does not match"
        )));
    }
    let authorisation = frame[2];

    bus.transaction(
        q.target(),
        &mut [
            Step::Select,
            Step::Write(&[COPY_SCRATCHPAD, lo, hi]),
            Step::Power {
                byte: authorisation,
                delay: PROGRAM_TIME,
            },
            Step::Read(&mut done),
            Step::End,
        ],
    )?;
    if done[0] != COPY_DONE {
        return Err(Error::ProtocolViolation(format!(
            "copy of row {address:#04X} not confirmed ({:#04X})",
            done[0]
        )));
    }
    Ok(())
}
