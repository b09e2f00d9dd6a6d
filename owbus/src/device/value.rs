//! Property values.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// A decoded property value.
///
/// Temperatures are carried in Celsius everywhere inside the crate and only
/// converted to the configured scale at the edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Binary(Vec<u8>),
    Ascii(String),
    Float(f64),
    Temperature(f64),
    Integer(i64),
    Unsigned(u64),
    YesNo(bool),
    /// Every element of an aggregate
    Array(Vec<Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) | Value::Temperature(v) => Some(v),
            Value::Integer(v) => Some(v as f64),
            Value::Unsigned(v) => Some(v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::YesNo(v) => Some(v),
            Value::Integer(v) => Some(v != 0),
            Value::Unsigned(v) => Some(v != 0),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Apply `f` to every temperature, descending into arrays.
    pub fn map_temperatures(self, f: impl Fn(f64) -> f64 + Copy) -> Self {
        match self {
            Value::Temperature(t) => Value::Temperature(f(t)),
            Value::Array(values) => {
                Value::Array(values.into_iter().map(|v| v.map_temperatures(f)).collect())
            }
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Binary(bytes) => write!(f, "{}", hex::encode_upper(bytes)),
            Value::Ascii(text) => f.write_str(text),
            Value::Float(v) | Value::Temperature(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::YesNo(v) => f.write_str(if *v { "1" } else { "0" }),
            Value::Array(values) => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
        }
    }
}

/// Scale temperatures are presented in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TemperatureScale {
    #[default]
    Celsius,
    Fahrenheit,
    Kelvin,
    Rankine,
}

impl TemperatureScale {
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            Self::Celsius => celsius,
            Self::Fahrenheit => celsius * 1.8 + 32.0,
            Self::Kelvin => celsius + 273.15,
            Self::Rankine => (celsius + 273.15) * 1.8,
        }
    }

    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            Self::Celsius => value,
            Self::Fahrenheit => (value - 32.0) / 1.8,
            Self::Kelvin => value - 273.15,
            Self::Rankine => value / 1.8 - 273.15,
        }
    }
}
