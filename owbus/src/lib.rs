//! 1-Wire bus transaction engine.
//!
//! Adapters drive the physical bus, connections serialise access to them,
//! the search module enumerates devices, and the device registry maps
//! family-specific properties onto bus transactions.

pub mod adapter;
pub mod address;
pub mod config;
pub mod connection;
pub mod crc;
pub mod device;
pub mod error;
pub mod hw_trait;
pub mod search;
pub mod tracing;
pub mod transaction;

pub use error::{Error, Result};
