//! Device families and their properties.
//!
//! Each supported chip family is described by a static [`DeviceFamily`]: its
//! family code, name, and a table of [`Property`] descriptors. A property
//! knows its size and format, how long its value may be cached, whether it
//! is an aggregate of several elements, and the functions that read and
//! write it over the bus. Families register themselves with `inventory` and
//! are gathered into a [`Catalog`](catalog::Catalog) at startup.

pub mod catalog;
pub mod query;
pub mod registry;
pub mod standard;
pub mod value;

pub mod ds18s20;
pub mod ds2401;
pub mod ds2413;
pub mod ds2431;

use std::fmt;

use crate::error::Result;

pub use catalog::{Catalog, Resolved};
pub use query::{Query, SiblingCache};
pub use registry::{DeviceRegistry, Settings};
pub use value::{TemperatureScale, Value};

/// What kind of thing a family describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A real 1-Wire chip
    Chip,
    /// A bus master that also shows up as a device
    Interface,
    /// Synthesised entries with no hardware behind them
    Pseudo,
}

/// How a property's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Binary,
    Ascii,
    Float,
    Temperature,
    Integer,
    Unsigned,
    YesNo,
    /// A directory of further properties; never read or written
    Subdir,
}

/// How long a value may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Read from the bus on every request
    Volatile,
    /// Changes only when written; cached until a write to the device
    Stable,
    /// Never changes, e.g. the ROM id or firmware version
    Static,
    /// Volatile, but served from a bus-wide simultaneous conversion
    Simultaneous,
    Subdir,
}

/// Size of one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Fixed(usize),
    Variable,
    Subdir,
}

/// How aggregate elements are named in paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    /// `.0`, `.1`, ...
    Numeric,
    /// `.A`, `.B`, ...
    Letters,
}

/// How aggregate elements are moved over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One bus operation reads or writes every element
    Packed,
    /// Each element is its own bus operation
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub elements: usize,
    pub naming: Naming,
    pub layout: Layout,
}

impl Aggregate {
    pub const fn new(elements: usize, naming: Naming, layout: Layout) -> Self {
        Self {
            elements,
            naming,
            layout,
        }
    }

    /// Parse the part after the dot: an element name or `ALL`.
    pub fn parse_extension(&self, text: &str) -> Option<Extension> {
        if text == "ALL" {
            return Some(Extension::All);
        }
        let index = match self.naming {
            Naming::Numeric if text.bytes().all(|b| b.is_ascii_digit()) => text.parse().ok()?,
            Naming::Numeric => return None,
            Naming::Letters => {
                let mut chars = text.chars();
                let letter = chars.next().filter(|c| c.is_ascii_uppercase())?;
                if chars.next().is_some() {
                    return None;
                }
                usize::from(letter as u8 - b'A')
            }
        };
        (index < self.elements).then_some(Extension::Element(index))
    }

    /// Path suffix of element `index`. Lettered names run `A` to `Z`;
    /// anything past that falls back to the number.
    pub fn element_name(&self, index: usize) -> String {
        match self.naming {
            Naming::Letters if index < 26 => char::from(b'A' + index as u8).to_string(),
            _ => index.to_string(),
        }
    }
}

/// Which part of an aggregate a request addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Element(usize),
    All,
}

pub type ReadFn = fn(&mut Query<'_>) -> Result<Value>;
pub type WriteFn = fn(&mut Query<'_>, &Value) -> Result<()>;

/// One named property of a device family.
#[derive(Clone, Copy)]
pub struct Property {
    /// Path below the device, subdirectories separated by `/`
    pub name: &'static str,
    pub size: Size,
    pub format: Format,
    pub class: CacheClass,
    pub aggregate: Option<Aggregate>,
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    /// Shown in listings; hidden properties are still addressable
    pub visible: bool,
}

impl Property {
    pub const fn new(name: &'static str, size: Size, format: Format, class: CacheClass) -> Self {
        Self {
            name,
            size,
            format,
            class,
            aggregate: None,
            read: None,
            write: None,
            visible: true,
        }
    }

    pub const fn subdir(name: &'static str) -> Self {
        Self::new(name, Size::Subdir, Format::Subdir, CacheClass::Subdir)
    }

    pub const fn reads(mut self, read: ReadFn) -> Self {
        self.read = Some(read);
        self
    }

    pub const fn writes(mut self, write: WriteFn) -> Self {
        self.write = Some(write);
        self
    }

    pub const fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub const fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn is_subdir(&self) -> bool {
        self.format == Format::Subdir
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("class", &self.class)
            .field("aggregate", &self.aggregate)
            .field("readable", &self.read.is_some())
            .field("writable", &self.write.is_some())
            .finish()
    }
}

/// A device family: one family code and its property table.
#[derive(Debug)]
pub struct DeviceFamily {
    pub code: u8,
    pub name: &'static str,
    pub kind: DeviceKind,
    pub properties: &'static [Property],
}

impl DeviceFamily {
    /// Look up a property of this family or one of the standard ones.
    pub fn property(&self, name: &str) -> Option<&'static Property> {
        self.properties
            .iter()
            .chain(standard::PROPERTIES.iter())
            .find(|p| p.name == name)
    }
}

inventory::collect!(DeviceFamily);
