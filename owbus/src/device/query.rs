//! Per-request context handed to property functions.

use std::collections::HashMap;

use super::registry::{DeviceRegistry, Settings};
use super::{DeviceFamily, Property, Value};
use crate::address::Address;
use crate::connection::{BusGuard, Connection};
use crate::error::{Error, Result};
use crate::transaction::{Step, Target};

type CacheKey = (Address, &'static str, Option<usize>);

/// Values read during one request.
///
/// Several properties of a device are usually decoded from one bus read
/// (a scratchpad, a status byte). Property functions fetch those through
/// [`Query::sibling`], which reads each one at most once per request.
#[derive(Debug, Default)]
pub struct SiblingCache {
    values: HashMap<CacheKey, Value>,
}

impl SiblingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: Address, name: &'static str, element: Option<usize>) -> Option<&Value> {
        self.values.get(&(address, name, element))
    }

    pub fn insert(&mut self, address: Address, name: &'static str, element: Option<usize>, value: Value) {
        self.values.insert((address, name, element), value);
    }

    /// Forget every element of one property.
    pub fn invalidate(&mut self, address: Address, name: &str) {
        self.values.retain(|(a, n, _), _| !(*a == address && *n == name));
    }

    /// Forget everything read from one device.
    pub fn invalidate_device(&mut self, address: Address) {
        self.values.retain(|(a, _, _), _| *a != address);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What a property function gets to work with.
pub struct Query<'q> {
    pub(super) registry: &'q DeviceRegistry,
    pub(super) connection: &'q Connection,
    pub(super) target: &'q Target,
    pub(super) family: &'static DeviceFamily,
    pub(super) property: &'static Property,
    pub(super) element: Option<usize>,
    pub(super) cache: &'q mut SiblingCache,
}

impl<'q> Query<'q> {
    pub fn address(&self) -> Result<Address> {
        self.target.address.ok_or_else(|| {
            Error::ProtocolViolation(format!("{} needs a device address", self.property.name))
        })
    }

    pub fn target(&self) -> &Target {
        self.target
    }

    pub fn family(&self) -> &'static DeviceFamily {
        self.family
    }

    pub fn property(&self) -> &'static Property {
        self.property
    }

    /// Element index of a separately handled aggregate.
    pub fn element(&self) -> Result<usize> {
        self.element.ok_or_else(|| Error::IndexOutOfRange {
            property: self.property.name,
            index: String::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        self.registry.settings()
    }

    /// Run one transaction on this device under its own bus lock.
    pub fn transaction(&self, steps: &mut [Step<'_>]) -> Result<()> {
        self.connection.transaction(self.target, steps)
    }

    /// Hold the bus across several transactions.
    pub fn lock(&self) -> BusGuard<'q> {
        self.connection.lock()
    }

    /// Read another property of the same device, reusing a value already
    /// read during this request.
    pub fn sibling(&mut self, name: &str) -> Result<Value> {
        let property = self.family.property(name).ok_or_else(|| {
            Error::NotFound(format!("{}: no property {name}", self.family.name))
        })?;
        let address = self.address()?;
        if let Some(value) = self.cache.get(address, property.name, None) {
            return Ok(value.clone());
        }
        self.registry.fetch(
            self.connection,
            self.target,
            self.family,
            property,
            None,
            self.cache,
        )
    }

    /// A binary sibling, at least `min_len` bytes long.
    pub fn sibling_bytes(&mut self, name: &str, min_len: usize) -> Result<Vec<u8>> {
        match self.sibling(name)? {
            Value::Binary(bytes) if bytes.len() >= min_len => Ok(bytes),
            other => Err(Error::ProtocolViolation(format!(
                "{name} gave {other:?}, expected {min_len} bytes"
            ))),
        }
    }

    /// Drop a sibling from every cache after the device changed.
    pub fn invalidate_sibling(&mut self, name: &'static str) -> Result<()> {
        let address = self.address()?;
        self.cache.invalidate(address, name);
        self.registry.forget(address, name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(serial: u8) -> Address {
        Address::from_family_serial(0x10, [serial, 0, 0, 0, 0, 0])
    }

    #[test]
    fn test_invalidate_drops_all_elements() {
        let mut cache = SiblingCache::new();
        cache.insert(address(1), "page", Some(0), Value::Binary(vec![0]));
        cache.insert(address(1), "page", Some(1), Value::Binary(vec![1]));
        cache.insert(address(1), "scratchpad", None, Value::Binary(vec![2]));
        cache.insert(address(2), "page", Some(0), Value::Binary(vec![3]));

        cache.invalidate(address(1), "page");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(address(1), "page", Some(1)).is_none());
        assert_eq!(cache.get(address(2), "page", Some(0)), Some(&Value::Binary(vec![3])));

        cache.invalidate_device(address(1));
        assert_eq!(cache.len(), 1);
    }
}
