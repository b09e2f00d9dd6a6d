//! Bus statistics.

use serde::Serialize;
use std::time::{Duration, SystemTime};

/// Counters kept per connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStatistics {
    /// Times the bus lock was taken
    pub locks: u64,
    pub unlocks: u64,
    /// Transactions and search passes attempted
    pub transactions: u64,
    /// Failed attempts of any kind
    pub errors: u64,
    /// Failed attempts that were checksum mismatches
    pub crc_errors: u64,
    /// Attempts refused without touching the adapter because the bus is bad
    pub rejected: u64,
    pub reconnects: u64,
    pub reconnect_errors: u64,
    /// Total time the bus lock was held
    pub busy_time: Duration,
    /// Wall-clock time the bus lock was last taken
    pub last_lock: Option<SystemTime>,
}
