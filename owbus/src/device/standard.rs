//! Properties every device carries.
//!
//! All of them except `present` are derived from the ROM code alone and
//! never touch the bus.

use super::{CacheClass, Format, Property, Query, Size, Value};
use crate::error::{Error, Result};
use crate::search::SearchMode;
use crate::transaction::Step;

pub static PROPERTIES: &[Property] = &[
    Property::new("address", Size::Fixed(16), Format::Ascii, CacheClass::Static).reads(address),
    Property::new("crc8", Size::Fixed(2), Format::Ascii, CacheClass::Static).reads(crc8),
    Property::new("family", Size::Fixed(2), Format::Ascii, CacheClass::Static).reads(family),
    Property::new("id", Size::Fixed(12), Format::Ascii, CacheClass::Static).reads(id),
    Property::new("locator", Size::Fixed(16), Format::Ascii, CacheClass::Static).reads(locator),
    Property::new("r_address", Size::Fixed(16), Format::Ascii, CacheClass::Static).reads(r_address),
    Property::new("r_id", Size::Fixed(12), Format::Ascii, CacheClass::Static).reads(r_id),
    Property::new("r_locator", Size::Fixed(16), Format::Ascii, CacheClass::Static).reads(locator),
    Property::new("type", Size::Variable, Format::Ascii, CacheClass::Static).reads(chip_type),
    Property::new("present", Size::Fixed(1), Format::YesNo, CacheClass::Volatile).reads(present),
];

/// Reported when no locator chip sits next to the device.
const NO_LOCATOR: &str = "FFFFFFFFFFFFFFFF";

fn address(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(q.address()?.to_hex()))
}

fn r_address(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(q.address()?.to_reversed_hex()))
}

fn crc8(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(format!("{:02X}", q.address()?.crc())))
}

fn family(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(format!("{:02X}", q.address()?.family())))
}

fn id(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(hex::encode_upper(q.address()?.serial())))
}

fn r_id(q: &mut Query<'_>) -> Result<Value> {
    let mut serial = q.address()?.serial();
    serial.reverse();
    Ok(Value::Ascii(hex::encode_upper(serial)))
}

fn locator(_: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(NO_LOCATOR.to_string()))
}

fn chip_type(q: &mut Query<'_>) -> Result<Value> {
    Ok(Value::Ascii(q.family().name.to_string()))
}

fn present(q: &mut Query<'_>) -> Result<Value> {
    match q.transaction(&mut [Step::Select, Step::Verify(SearchMode::Normal), Step::End]) {
        Ok(()) => Ok(Value::YesNo(true)),
        Err(Error::NotFound(_)) => Ok(Value::YesNo(false)),
        Err(e) => Err(e),
    }
}
