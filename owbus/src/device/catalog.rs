//! Lookup of families and property paths.

use std::collections::BTreeMap;

use super::{DeviceFamily, Extension, Naming, Property};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// A property path resolved against a family.
#[derive(Debug, Clone, Copy)]
pub struct Resolved {
    pub family: &'static DeviceFamily,
    pub property: &'static Property,
    /// Present exactly when the property is an aggregate
    pub extension: Option<Extension>,
}

impl Resolved {
    /// Path of the property below the device, extension included.
    pub fn path(&self) -> String {
        match (self.property.aggregate, self.extension) {
            (Some(aggregate), Some(Extension::Element(index))) => {
                format!("{}.{}", self.property.name, aggregate.element_name(index))
            }
            (_, Some(Extension::All)) => format!("{}.ALL", self.property.name),
            _ => self.property.name.to_string(),
        }
    }
}

/// All known device families, indexed by family code.
#[derive(Debug, Default)]
pub struct Catalog {
    families: BTreeMap<u8, &'static DeviceFamily>,
}

impl Catalog {
    /// The families compiled into this binary.
    pub fn builtin() -> Result<Self> {
        Self::new(inventory::iter::<DeviceFamily>())
    }

    /// Build a catalog, rejecting malformed property tables.
    pub fn new(families: impl IntoIterator<Item = &'static DeviceFamily>) -> Result<Self> {
        let mut catalog = Self::default();
        for family in families {
            validate(family)?;
            if let Some(previous) = catalog.families.insert(family.code, family) {
                return Err(Error::Config(format!(
                    "family code {:02X} claimed by both {} and {}",
                    family.code, previous.name, family.name
                )));
            }
        }
        debug!(families = catalog.families.len(), "device catalog built");
        Ok(catalog)
    }

    pub fn family(&self, code: u8) -> Option<&'static DeviceFamily> {
        self.families.get(&code).copied()
    }

    /// Families in family-code order.
    pub fn families(&self) -> impl Iterator<Item = &'static DeviceFamily> + '_ {
        self.families.values().copied()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Resolve `path` (e.g. `pages/page.2`, `PIO.A`, `temperature`) for a
    /// device of family `code`.
    pub fn resolve(&self, code: u8, path: &str) -> Result<Resolved> {
        let family = self
            .family(code)
            .ok_or_else(|| Error::NotFound(format!("family {code:02X}")))?;
        resolve(family, path)
    }
}

fn resolve(family: &'static DeviceFamily, path: &str) -> Result<Resolved> {
    if let Some(property) = family.property(path) {
        if property.aggregate.is_some() {
            return Err(Error::NotFound(format!(
                "{}: {path} needs an element or ALL",
                family.name
            )));
        }
        return Ok(Resolved {
            family,
            property,
            extension: None,
        });
    }

    let not_found = || Error::NotFound(format!("{}: no property {path}", family.name));
    let (base, suffix) = path.rsplit_once('.').ok_or_else(not_found)?;
    let property = family.property(base).ok_or_else(not_found)?;
    let aggregate = property.aggregate.ok_or_else(not_found)?;
    let extension = aggregate
        .parse_extension(suffix)
        .ok_or_else(|| Error::IndexOutOfRange {
            property: property.name,
            index: suffix.to_string(),
        })?;
    Ok(Resolved {
        family,
        property,
        extension: Some(extension),
    })
}

/// Lettered aggregates run from `A` to `Z`.
const LETTERS: usize = 26;

fn validate(family: &DeviceFamily) -> Result<()> {
    for property in family.properties {
        let bad = |reason: &str| -> Result<()> {
            Err(Error::Config(format!(
                "{} property {}: {reason}",
                family.name, property.name
            )))
        };
        if property.is_subdir() && (property.read.is_some() || property.write.is_some()) {
            return bad("a subdirectory cannot be read or written");
        }
        if property.aggregate.is_some_and(|a| a.elements == 0) {
            return bad("aggregate without elements");
        }
        if property
            .aggregate
            .is_some_and(|a| a.naming == Naming::Letters && a.elements > LETTERS)
        {
            return bad("more lettered elements than letters");
        }
        if let Some((parent, _)) = property.name.rsplit_once('/') {
            let has_parent = family
                .properties
                .iter()
                .any(|p| p.is_subdir() && p.name == parent);
            if !has_parent {
                return bad("parent directory is not declared");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        ds18s20, ds2401, ds2413, ds2431, Aggregate, CacheClass, DeviceKind, Format, Layout, Naming,
        Query, Size, Value,
    };

    static BROKEN_SUBDIR: DeviceFamily = DeviceFamily {
        code: 0xF0,
        name: "broken",
        kind: DeviceKind::Pseudo,
        properties: &[Property::subdir("dir").reads(always_yes)],
    };

    fn always_yes(_: &mut Query<'_>) -> Result<Value> {
        Ok(Value::YesNo(true))
    }

    static EMPTY_AGGREGATE: DeviceFamily = DeviceFamily {
        code: 0xF1,
        name: "empty",
        kind: DeviceKind::Pseudo,
        properties: &[Property::new("x", Size::Fixed(1), Format::YesNo, CacheClass::Volatile)
            .aggregate(Aggregate::new(0, Naming::Numeric, Layout::Packed))],
    };

    static TOO_MANY_LETTERS: DeviceFamily = DeviceFamily {
        code: 0xF4,
        name: "alphabet",
        kind: DeviceKind::Pseudo,
        properties: &[Property::new("x", Size::Fixed(1), Format::YesNo, CacheClass::Volatile)
            .aggregate(Aggregate::new(27, Naming::Letters, Layout::Packed))],
    };

    static ORPHAN: DeviceFamily = DeviceFamily {
        code: 0xF2,
        name: "orphan",
        kind: DeviceKind::Pseudo,
        properties: &[Property::new("dir/x", Size::Fixed(1), Format::YesNo, CacheClass::Volatile)],
    };

    #[test]
    fn test_builtin_families() {
        let catalog = Catalog::builtin().unwrap();
        for code in [ds2401::FAMILY, ds2401::DS1420_FAMILY, ds18s20::FAMILY, ds2431::FAMILY, ds2413::FAMILY] {
            assert!(catalog.family(code).is_some(), "family {code:02X} missing");
        }
        assert!(catalog.family(0x28).is_none());
    }

    #[test]
    fn test_malformed_tables_rejected() {
        for family in [&BROKEN_SUBDIR, &EMPTY_AGGREGATE, &TOO_MANY_LETTERS, &ORPHAN] {
            assert!(matches!(Catalog::new([family]), Err(Error::Config(_))), "{}", family.name);
        }
    }

    #[test]
    fn test_duplicate_code_rejected() {
        static FIRST: DeviceFamily = DeviceFamily {
            code: 0xF3,
            name: "first",
            kind: DeviceKind::Pseudo,
            properties: &[],
        };
        static SECOND: DeviceFamily = DeviceFamily {
            code: 0xF3,
            name: "second",
            kind: DeviceKind::Pseudo,
            properties: &[],
        };
        assert!(matches!(Catalog::new([&FIRST, &SECOND]), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_paths() {
        let catalog = Catalog::builtin().unwrap();

        let resolved = catalog.resolve(ds18s20::FAMILY, "temperature").unwrap();
        assert_eq!(resolved.property.name, "temperature");
        assert_eq!(resolved.extension, None);

        let resolved = catalog.resolve(ds2431::FAMILY, "pages/page.2").unwrap();
        assert_eq!(resolved.extension, Some(Extension::Element(2)));
        assert_eq!(resolved.path(), "pages/page.2");

        let resolved = catalog.resolve(ds2413::FAMILY, "PIO.ALL").unwrap();
        assert_eq!(resolved.extension, Some(Extension::All));

        let resolved = catalog.resolve(ds2401::FAMILY, "TSH202/temperature").unwrap();
        assert_eq!(resolved.family.code, ds2401::FAMILY);

        // Standard properties exist on every family.
        assert!(catalog.resolve(ds2413::FAMILY, "address").is_ok());
    }

    #[test]
    fn test_resolve_errors() {
        let catalog = Catalog::builtin().unwrap();
        assert!(matches!(catalog.resolve(0x28, "temperature"), Err(Error::NotFound(_))));
        assert!(matches!(catalog.resolve(ds18s20::FAMILY, "humidity"), Err(Error::NotFound(_))));
        assert!(matches!(catalog.resolve(ds18s20::FAMILY, "temperature.1"), Err(Error::NotFound(_))));
        assert!(matches!(catalog.resolve(ds2413::FAMILY, "PIO"), Err(Error::NotFound(_))));
        assert!(matches!(
            catalog.resolve(ds2413::FAMILY, "PIO.C"),
            Err(Error::IndexOutOfRange { property: "PIO", .. })
        ));
        assert!(matches!(
            catalog.resolve(ds2431::FAMILY, "pages/page.A"),
            Err(Error::IndexOutOfRange { .. })
        ));
    }
}
