//! Common error types for owbus.
//!
//! This module provides a centralized Error enum using thiserror. The
//! variants follow the bus error taxonomy: transport failures drive the
//! reconnect state machine, everything else is reported to the caller as-is.

use thiserror::Error;

use crate::transaction::StepKind;

/// Main error type for owbus operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error reported by the adapter's transport
    #[error("transport failure during {step}: {reason}")]
    TransportFailure { step: StepKind, reason: String },

    /// Received data failed CRC8/CRC16 validation
    #[error("checksum mismatch in {step} step (residue 0x{residue:04X})")]
    ChecksumMismatch { step: StepKind, residue: u16 },

    /// The bus produced something no well-behaved device can produce
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Path resolves to no device family or property
    #[error("not found: {0}")]
    NotFound(String),

    /// Property has no read operation
    #[error("property {0} is not readable")]
    NotReadable(&'static str),

    /// Property has no write operation
    #[error("property {0} is not writable")]
    NotWritable(&'static str),

    /// Aggregate index out of range or of the wrong naming scheme
    #[error("index {index} out of range for {property}")]
    IndexOutOfRange { property: &'static str, index: String },

    /// Capability not available on this adapter variant
    #[error("{capability} is not supported by the {adapter} adapter")]
    Unsupported {
        capability: &'static str,
        adapter: &'static str,
    },

    /// Connection has given up reconnecting
    #[error("bus {0} is permanently unavailable")]
    PermanentFailure(usize),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Unparsable device address text
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    /// Write payload that cannot be encoded for the property
    #[error("invalid value for {property}: {reason}")]
    InvalidValue {
        property: &'static str,
        reason: String,
    },

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a transport failure in a given step.
    pub fn transport(step: StepKind, reason: impl Into<String>) -> Self {
        Self::TransportFailure {
            step,
            reason: reason.into(),
        }
    }

    /// Whether this error counts against the connection's reconnect budget.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure { .. } | Self::Io(_))
    }

    /// The transaction step that failed, if the error came from one.
    pub fn step(&self) -> Option<StepKind> {
        match self {
            Self::TransportFailure { step, .. } | Self::ChecksumMismatch { step, .. } => {
                Some(*step)
            }
            _ => None,
        }
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(Error::transport(StepKind::Read, "timeout").is_transport());
        assert!(Error::Io(std::io::Error::other("gone")).is_transport());
        assert!(!Error::ChecksumMismatch {
            step: StepKind::Crc8,
            residue: 0x12
        }
        .is_transport());
        assert!(!Error::PermanentFailure(0).is_transport());
    }

    #[test]
    fn step_is_reported() {
        let err = Error::ChecksumMismatch {
            step: StepKind::Crc16,
            residue: 0x1234,
        };
        assert_eq!(err.step(), Some(StepKind::Crc16));
        assert_eq!(
            err.to_string(),
            "checksum mismatch in crc16 step (residue 0x1234)"
        );
    }
}
