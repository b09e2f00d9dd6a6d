//! Property reads and writes.
//!
//! The registry turns a resolved property path into calls of the property's
//! read or write function. It takes the device lock for the whole request,
//! splits aggregates into elements or gathers them back, keeps the cache of
//! static and stable values, and converts temperatures between Celsius and
//! the configured scale.

use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    standard, CacheClass, Catalog, DeviceFamily, Extension, Format, Layout, Property, Query,
    Resolved, SiblingCache, TemperatureScale, Value,
};
use crate::address::Address;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transaction::Target;

/// Behaviour switches taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub temperature_scale: TemperatureScale,
    /// Keep static and stable values between requests
    pub cache_static: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            temperature_scale: TemperatureScale::Celsius,
            cache_static: true,
        }
    }
}

type StoreKey = (Address, &'static str, Option<usize>);

pub struct DeviceRegistry {
    catalog: Catalog,
    settings: Settings,
    stored: Mutex<HashMap<StoreKey, (CacheClass, Value)>>,
}

impl DeviceRegistry {
    pub fn new(catalog: Catalog, settings: Settings) -> Self {
        Self {
            catalog,
            settings,
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// A registry over every family compiled in.
    pub fn builtin(settings: Settings) -> Result<Self> {
        Ok(Self::new(Catalog::builtin()?, settings))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Resolve a device path such as `10.67C6697351FF/temperature`.
    pub fn resolve(&self, path: &str) -> Result<(Address, Resolved)> {
        let path = path.trim_start_matches('/');
        let (device, property) = path
            .split_once('/')
            .ok_or_else(|| Error::NotFound(format!("{path}: no property given")))?;
        let address: Address = device.parse()?;
        let resolved = self.catalog.resolve(address.family(), property)?;
        Ok((address, resolved))
    }

    /// Readable properties of a family, aggregates as `.ALL`.
    pub fn listing(&self, family: &'static DeviceFamily) -> Vec<Resolved> {
        family
            .properties
            .iter()
            .chain(standard::PROPERTIES.iter())
            .filter(|p| p.visible && p.read.is_some())
            .map(|property| Resolved {
                family,
                property,
                extension: property.aggregate.map(|_| Extension::All),
            })
            .collect()
    }

    /// Read a property, temperatures in the configured scale.
    pub fn read(
        &self,
        connection: &Connection,
        target: &Target,
        resolved: &Resolved,
        cache: &mut SiblingCache,
    ) -> Result<Value> {
        let property = resolved.property;
        if property.read.is_none() {
            return Err(Error::NotReadable(property.name));
        }
        let address = device_address(target, property)?;
        let _device = connection.lock_device(address);
        let family = resolved.family;

        let value = match property.aggregate {
            None => self.fetch(connection, target, family, property, None, cache)?,
            Some(aggregate) => {
                match (aggregate.layout, resolved.extension.unwrap_or(Extension::All)) {
                    (Layout::Packed, extension) => {
                        let all = self.fetch(connection, target, family, property, None, cache)?;
                        let mut elements = packed(property, all, aggregate.elements)?;
                        match extension {
                            Extension::All => Value::Array(elements),
                            Extension::Element(index) => elements.swap_remove(index),
                        }
                    }
                    (Layout::Separate, Extension::Element(index)) => {
                        self.fetch(connection, target, family, property, Some(index), cache)?
                    }
                    (Layout::Separate, Extension::All) => Value::Array(
                        (0..aggregate.elements)
                            .map(|i| self.fetch(connection, target, family, property, Some(i), &mut *cache))
                            .collect::<Result<_>>()?,
                    ),
                }
            }
        };

        let scale = self.settings.temperature_scale;
        Ok(value.map_temperatures(|celsius| scale.from_celsius(celsius)))
    }

    /// Write a property; temperatures are taken in the configured scale.
    pub fn write(
        &self,
        connection: &Connection,
        target: &Target,
        resolved: &Resolved,
        value: Value,
        cache: &mut SiblingCache,
    ) -> Result<()> {
        let property = resolved.property;
        if property.write.is_none() {
            return Err(Error::NotWritable(property.name));
        }
        let address = device_address(target, property)?;
        let value = if property.format == Format::Temperature {
            into_celsius(value, self.settings.temperature_scale)
        } else {
            value
        };
        let _device = connection.lock_device(address);
        let family = resolved.family;

        match property.aggregate {
            None => self.store(connection, target, family, property, None, &value, cache)?,
            Some(aggregate) => {
                match (aggregate.layout, resolved.extension.unwrap_or(Extension::All)) {
                    (Layout::Packed, Extension::Element(index)) => {
                        // Read-modify-write under the device lock.
                        let current = self.fetch(connection, target, family, property, None, cache)?;
                        let mut elements = packed(property, current, aggregate.elements)?;
                        elements[index] = value;
                        let all = Value::Array(elements);
                        self.store(connection, target, family, property, None, &all, cache)?;
                    }
                    (Layout::Packed, Extension::All) => {
                        let elements = whole(property, value, aggregate.elements)?;
                        let all = Value::Array(elements);
                        self.store(connection, target, family, property, None, &all, cache)?;
                    }
                    (Layout::Separate, Extension::Element(index)) => {
                        self.store(connection, target, family, property, Some(index), &value, cache)?;
                    }
                    (Layout::Separate, Extension::All) => {
                        let elements = whole(property, value, aggregate.elements)?;
                        for (index, element) in elements.iter().enumerate() {
                            self.store(connection, target, family, property, Some(index), element, cache)?;
                        }
                    }
                }
            }
        }

        self.forget_device(address);
        cache.invalidate_device(address);
        debug!(device = %address, property = %resolved.path(), "property written");
        Ok(())
    }

    /// Read one property or element, without consulting the request cache.
    pub(super) fn fetch(
        &self,
        connection: &Connection,
        target: &Target,
        family: &'static DeviceFamily,
        property: &'static Property,
        element: Option<usize>,
        cache: &mut SiblingCache,
    ) -> Result<Value> {
        let read = property.read.ok_or(Error::NotReadable(property.name))?;
        let address = device_address(target, property)?;
        let key = (address, property.name, element);
        let storable = self.settings.cache_static
            && matches!(property.class, CacheClass::Static | CacheClass::Stable);

        if storable {
            if let Some((_, value)) = self.stored.lock().get(&key) {
                trace!(device = %address, property = property.name, "served from cache");
                cache.insert(address, property.name, element, value.clone());
                return Ok(value.clone());
            }
        }

        let value = {
            let mut query = Query {
                registry: self,
                connection,
                target,
                family,
                property,
                element,
                cache: &mut *cache,
            };
            read(&mut query)?
        };

        if storable {
            self.stored
                .lock()
                .insert(key, (property.class, value.clone()));
        }
        cache.insert(address, property.name, element, value.clone());
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        connection: &Connection,
        target: &Target,
        family: &'static DeviceFamily,
        property: &'static Property,
        element: Option<usize>,
        value: &Value,
        cache: &mut SiblingCache,
    ) -> Result<()> {
        let write = property.write.ok_or(Error::NotWritable(property.name))?;
        let mut query = Query {
            registry: self,
            connection,
            target,
            family,
            property,
            element,
            cache,
        };
        write(&mut query, value)
    }

    /// Drop stored values of one property.
    pub(super) fn forget(&self, address: Address, name: &str) {
        self.stored
            .lock()
            .retain(|(a, n, _), _| !(*a == address && *n == name));
    }

    /// Drop every stable value of a device; static ones survive.
    fn forget_device(&self, address: Address) {
        self.stored
            .lock()
            .retain(|(a, _, _), (class, _)| *a != address || *class == CacheClass::Static);
    }
}

fn device_address(target: &Target, property: &Property) -> Result<Address> {
    target.address.ok_or_else(|| {
        Error::ProtocolViolation(format!("{} needs a device address", property.name))
    })
}

/// Elements of a packed aggregate as returned by its read function.
fn packed(property: &Property, value: Value, count: usize) -> Result<Vec<Value>> {
    match value {
        Value::Array(elements) if elements.len() == count => Ok(elements),
        other => Err(Error::ProtocolViolation(format!(
            "{} decoded to {other:?}, expected {count} elements",
            property.name
        ))),
    }
}

/// Elements supplied by a caller writing a whole aggregate.
fn whole(property: &'static Property, value: Value, count: usize) -> Result<Vec<Value>> {
    match value {
        Value::Array(elements) if elements.len() == count => Ok(elements),
        other => Err(Error::InvalidValue {
            property: property.name,
            reason: format!("expected {count} elements, got {other}"),
        }),
    }
}

fn into_celsius(value: Value, scale: TemperatureScale) -> Value {
    match value {
        Value::Array(values) => {
            Value::Array(values.into_iter().map(|v| into_celsius(v, scale)).collect())
        }
        other => match other.as_f64() {
            Some(t) => Value::Temperature(scale.to_celsius(t)),
            None => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::fake::{FakeAdapter, FakeDevice, FakeHandle};
    use crate::adapter::Transport;
    use crate::device::{ds18s20, ds2401, ds2413, ds2431};

    fn setup(devices: Vec<FakeDevice>, settings: Settings) -> (DeviceRegistry, Connection, FakeHandle) {
        let adapter = FakeAdapter::new(devices);
        let handle = adapter.handle();
        let connection =
            Connection::new(0, Transport::Fake { devices: vec![] }, Box::new(adapter), 3).unwrap();
        (DeviceRegistry::builtin(settings).unwrap(), connection, handle)
    }

    fn device(family: u8) -> FakeDevice {
        FakeDevice::new(Address::from_family_serial(family, [0x51, 0x73, 0x69, 0xC6, 0x67, 0x00]))
    }

    fn read(registry: &DeviceRegistry, connection: &Connection, path: &str) -> Result<Value> {
        let (address, resolved) = registry.resolve(path)?;
        registry.read(connection, &Target::device(address), &resolved, &mut SiblingCache::new())
    }

    fn write(registry: &DeviceRegistry, connection: &Connection, path: &str, value: Value) -> Result<()> {
        let (address, resolved) = registry.resolve(path)?;
        registry.write(connection, &Target::device(address), &resolved, value, &mut SiblingCache::new())
    }

    #[test]
    fn test_resolve_full_path() {
        let registry = DeviceRegistry::builtin(Settings::default()).unwrap();
        let address = device(ds18s20::FAMILY).address();
        let (found, resolved) = registry.resolve(&format!("/{address}/temperature")).unwrap();
        assert_eq!(found, address);
        assert_eq!(resolved.property.name, "temperature");

        assert!(matches!(registry.resolve("10.000000000000"), Err(Error::NotFound(_))));
        assert!(matches!(registry.resolve("xyz/temperature"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_scale_applied_at_boundary() {
        let settings = Settings {
            temperature_scale: TemperatureScale::Fahrenheit,
            ..Settings::default()
        };
        let mut sensor = device(ds18s20::FAMILY);
        sensor.set_temperature(25.0);
        let address = sensor.address();
        let (registry, connection, handle) = setup(vec![sensor], settings);

        let value = read(&registry, &connection, &format!("{address}/temperature")).unwrap();
        assert!(matches!(value, Value::Temperature(_)));
        assert!((value.as_f64().unwrap() - 77.0).abs() < 1e-9);

        // 86 F is 30 C on the device.
        write(&registry, &connection, &format!("{address}/temphigh"), Value::Float(86.0)).unwrap();
        let th = handle.with_device(address, |d| d.scratchpad()[2]).unwrap();
        assert_eq!(th, 30);
    }

    #[test]
    fn test_static_values_are_kept() {
        let tsh = device(ds2401::FAMILY);
        let address = tsh.address();
        let (registry, connection, handle) = setup(vec![tsh], Settings::default());
        let path = format!("{address}/TSH202/firmware_version");

        let first = read(&registry, &connection, &path).unwrap();
        let operations = handle.operations();
        let second = read(&registry, &connection, &path).unwrap();
        assert_eq!(first, second);
        assert_eq!(handle.operations(), operations);
    }

    #[test]
    fn test_static_cache_can_be_disabled() {
        let settings = Settings {
            cache_static: false,
            ..Settings::default()
        };
        let tsh = device(ds2401::FAMILY);
        let address = tsh.address();
        let (registry, connection, handle) = setup(vec![tsh], settings);
        let path = format!("{address}/TSH202/firmware_version");

        read(&registry, &connection, &path).unwrap();
        let operations = handle.operations();
        read(&registry, &connection, &path).unwrap();
        assert!(handle.operations() > operations);
    }

    #[test]
    fn test_write_invalidates_stable_values() {
        let eeprom = device(ds2431::FAMILY);
        let address = eeprom.address();
        let (registry, connection, _) = setup(vec![eeprom], Settings::default());
        let page = format!("{address}/pages/page.1");

        assert_eq!(read(&registry, &connection, &page).unwrap(), Value::Binary(vec![0; 32]));
        write(&registry, &connection, &format!("{address}/memory"), Value::Binary(vec![0x5A; 128]))
            .unwrap();
        assert_eq!(read(&registry, &connection, &page).unwrap(), Value::Binary(vec![0x5A; 32]));
    }

    #[test]
    fn test_packed_element_write_keeps_others() {
        let pio = device(ds2413::FAMILY);
        let address = pio.address();
        let (registry, connection, handle) = setup(vec![pio], Settings::default());

        write(&registry, &connection, &format!("{address}/PIO.B"), Value::YesNo(true)).unwrap();
        let latches = handle
            .with_device(address, |d| (d.pio_latch(0), d.pio_latch(1)))
            .unwrap();
        // Channel A untouched (off), channel B switched on.
        assert_eq!(latches, (true, false));

        let all = read(&registry, &connection, &format!("{address}/PIO.ALL")).unwrap();
        assert_eq!(all, Value::Array(vec![Value::YesNo(false), Value::YesNo(true)]));
    }

    #[test]
    fn test_whole_aggregate_needs_every_element() {
        let pio = device(ds2413::FAMILY);
        let address = pio.address();
        let (registry, connection, _) = setup(vec![pio], Settings::default());

        let err = write(
            &registry,
            &connection,
            &format!("{address}/PIO.ALL"),
            Value::Array(vec![Value::YesNo(true)]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidValue { property: "PIO", .. }));
    }

    #[test]
    fn test_not_writable() {
        let sensor = device(ds18s20::FAMILY);
        let address = sensor.address();
        let (registry, connection, _) = setup(vec![sensor], Settings::default());
        assert!(matches!(
            write(&registry, &connection, &format!("{address}/temperature"), Value::Float(1.0)),
            Err(Error::NotWritable("temperature"))
        ));
    }

    #[test]
    fn test_listing_expands_aggregates() {
        let registry = DeviceRegistry::builtin(Settings::default()).unwrap();
        let family = registry.catalog().family(ds2413::FAMILY).unwrap();
        let paths: Vec<_> = registry.listing(family).iter().map(Resolved::path).collect();
        assert!(paths.contains(&"PIO.ALL".to_string()));
        assert!(paths.contains(&"address".to_string()));
        assert!(!paths.iter().any(|p| p == "status"));
    }
}
