//! Per-connection failure tracking.
//!
//! Transport failures count against a budget of consecutive failures. Each
//! one below the limit earns a single reconnect attempt. Reaching the limit,
//! or a reconnect attempt that fails, marks the connection bad; requests then
//! fail immediately until the bus is explicitly redetected. Any successful
//! operation clears the count.

use strum::Display;

use crate::error::{Error, Result};

/// Health of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReconnectState {
    Ok,
    /// Failed, reconnect in progress
    Error,
    /// Gave up; only `redetect` brings it back
    Bad,
}

#[derive(Debug)]
pub struct Reconnect {
    state: ReconnectState,
    failures: u32,
    limit: u32,
}

impl Reconnect {
    pub fn new(limit: u32) -> Self {
        Self {
            state: ReconnectState::Ok,
            failures: 0,
            limit: limit.max(1),
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Consecutive transport failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Refuse work on a bad connection.
    pub fn check(&self, index: usize) -> Result<()> {
        match self.state {
            ReconnectState::Bad => Err(Error::PermanentFailure(index)),
            _ => Ok(()),
        }
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
        self.state = ReconnectState::Ok;
    }

    /// Count a transport failure. Returns whether a reconnect should be
    /// attempted; false means the connection is now bad.
    pub fn failed(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= self.limit {
            self.state = ReconnectState::Bad;
            false
        } else {
            self.state = ReconnectState::Error;
            true
        }
    }

    /// The transport was reopened. The failure count stands until an
    /// operation succeeds on it.
    pub fn reconnected(&mut self) {
        self.state = ReconnectState::Ok;
    }

    /// The reconnect attempt itself failed; no further attempts are made.
    pub fn reconnect_failed(&mut self) {
        self.state = ReconnectState::Bad;
    }

    /// Start over after an explicit redetect.
    pub fn reset(&mut self) {
        self.succeeded();
    }
}
