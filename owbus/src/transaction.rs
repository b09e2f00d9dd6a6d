//! Bus transactions.
//!
//! A transaction is an ordered list of [`Step`]s run against one bus while
//! its lock is held. The list always opens with a `Select` and closes with
//! `End`; the first failing step aborts everything after it. Checksum steps
//! validate the bytes received by the most recent data step, so a log reads
//! like the datasheet: command, read, CRC.

use std::fmt;
use std::time::Duration;
use strum::{Display, IntoStaticStr};

use crate::adapter::{self, coupler, Adapter, BusSpeed};
use crate::address::Address;
use crate::crc::{crc16_seeded, crc8_seeded, CRC16_RESIDUE};
use crate::error::{Error, Result};
use crate::search::{self, SearchMode};
use crate::tracing::prelude::*;

/// Step discriminant, for logging and error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StepKind {
    Select,
    Write,
    Read,
    Exchange,
    Power,
    ProgramPulse,
    Reset,
    Crc8,
    Crc8Seeded,
    Crc16,
    Crc16Seeded,
    Verify,
    Speed,
    Nop,
    End,
}

/// One bus operation.
#[derive(Debug)]
pub enum Step<'a> {
    /// Reset, then address the transaction's target
    Select,
    /// Send bytes; the echo must match
    Write(&'a [u8]),
    /// Clock in bytes
    Read(&'a mut [u8]),
    /// Send bytes and keep whatever comes back
    Exchange { out: &'a [u8], input: &'a mut [u8] },
    /// Send one byte, then strong pull-up for `delay`
    Power { byte: u8, delay: Duration },
    ProgramPulse,
    /// Bare reset; fails when nothing answers
    Reset,
    /// Last received bytes end in their CRC8
    Crc8,
    /// As `Crc8`, with the register preloaded from earlier traffic
    Crc8Seeded(u8),
    /// Last received bytes end in their inverted CRC16
    Crc16,
    Crc16Seeded(u16),
    /// Bit-level confirmation that the target answers a search
    Verify(SearchMode),
    Speed(BusSpeed),
    Nop,
    End,
}

impl Step<'_> {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Select => StepKind::Select,
            Step::Write(_) => StepKind::Write,
            Step::Read(_) => StepKind::Read,
            Step::Exchange { .. } => StepKind::Exchange,
            Step::Power { .. } => StepKind::Power,
            Step::ProgramPulse => StepKind::ProgramPulse,
            Step::Reset => StepKind::Reset,
            Step::Crc8 => StepKind::Crc8,
            Step::Crc8Seeded(_) => StepKind::Crc8Seeded,
            Step::Crc16 => StepKind::Crc16,
            Step::Crc16Seeded(_) => StepKind::Crc16Seeded,
            Step::Verify(_) => StepKind::Verify,
            Step::Speed(_) => StepKind::Speed,
            Step::Nop => StepKind::Nop,
            Step::End => StepKind::End,
        }
    }

    fn checksum(&self) -> Option<Checksum> {
        match self {
            Step::Crc8 => Some(Checksum::Crc8(0)),
            Step::Crc8Seeded(seed) => Some(Checksum::Crc8(*seed)),
            Step::Crc16 => Some(Checksum::Crc16(0)),
            Step::Crc16Seeded(seed) => Some(Checksum::Crc16(*seed)),
            _ => None,
        }
    }

    fn received(&self) -> Option<&[u8]> {
        match self {
            Step::Read(input) => Some(input),
            Step::Exchange { input, .. } => Some(input),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Checksum {
    Crc8(u8),
    Crc16(u16),
}

/// Which output of a DS2409 coupler to switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    Main,
    Aux,
}

impl Line {
    pub fn command(self) -> u8 {
        match self {
            Line::Main => coupler::SMART_ON_MAIN,
            Line::Aux => coupler::SMART_ON_AUX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Branch {
    pub coupler: Address,
    pub line: Line,
}

/// Chain of couplers between the adapter and a device. Empty for devices
/// on the trunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BusPath(Vec<Branch>);

impl BusPath {
    pub fn new(branches: Vec<Branch>) -> Self {
        Self(branches)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BusPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for branch in &self.0 {
            let line = match branch.line {
                Line::Main => "main",
                Line::Aux => "aux",
            };
            write!(f, "/{}/{line}", branch.coupler)?;
        }
        Ok(())
    }
}

/// What a `Select` step addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    /// `None` addresses every device (Skip ROM)
    pub address: Option<Address>,
    pub path: BusPath,
}

impl Target {
    pub fn device(address: Address) -> Self {
        Self {
            address: Some(address),
            path: BusPath::default(),
        }
    }

    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn on_path(mut self, path: BusPath) -> Self {
        self.path = path;
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}/{address}", self.path),
            None => write!(f, "{}/*", self.path),
        }
    }
}

/// Builder for a step list that starts with `Select` and ends with `End`.
///
/// ```
/// use owbus::transaction::TransactionLog;
///
/// let mut data = [0u8; 9];
/// let log = TransactionLog::new()
///     .write(&[0xBE])
///     .read(&mut data)
///     .crc8()
///     .end();
/// assert_eq!(log.len(), 5);
/// ```
#[derive(Debug)]
pub struct TransactionLog<'a> {
    steps: Vec<Step<'a>>,
}

impl<'a> TransactionLog<'a> {
    pub fn new() -> Self {
        Self {
            steps: vec![Step::Select],
        }
    }

    pub fn step(mut self, step: Step<'a>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn write(self, data: &'a [u8]) -> Self {
        self.step(Step::Write(data))
    }

    pub fn read(self, buf: &'a mut [u8]) -> Self {
        self.step(Step::Read(buf))
    }

    pub fn exchange(self, out: &'a [u8], input: &'a mut [u8]) -> Self {
        self.step(Step::Exchange { out, input })
    }

    pub fn power(self, byte: u8, delay: Duration) -> Self {
        self.step(Step::Power { byte, delay })
    }

    pub fn crc8(self) -> Self {
        self.step(Step::Crc8)
    }

    pub fn crc16(self) -> Self {
        self.step(Step::Crc16)
    }

    pub fn crc16_seeded(self, seed: u16) -> Self {
        self.step(Step::Crc16Seeded(seed))
    }

    pub fn end(self) -> Self {
        self.step(Step::End)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps_mut(&mut self) -> &mut [Step<'a>] {
        &mut self.steps
    }
}

impl Default for TransactionLog<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `steps` against `adapter`, stopping at `End` or the first failure.
///
/// The caller owns the bus lock for the duration.
pub fn interpret<A: Adapter + ?Sized>(
    adapter: &mut A,
    target: &Target,
    steps: &mut [Step<'_>],
) -> Result<()> {
    if !matches!(steps.first(), Some(Step::Select)) {
        return Err(Error::ProtocolViolation(
            "transaction does not open with select".to_string(),
        ));
    }

    // Index of the latest step that received bytes.
    let mut last_received: Option<usize> = None;

    for i in 0..steps.len() {
        trace!(step = %steps[i].kind(), %target, "transaction step");

        if let Some(checksum) = steps[i].checksum() {
            let kind = steps[i].kind();
            let data = last_received
                .and_then(|j| steps[j].received())
                .ok_or_else(|| {
                    Error::ProtocolViolation(format!("{kind} step has no received data to check"))
                })?;
            check(checksum, kind, data)?;
            continue;
        }

        match &mut steps[i] {
            Step::Select => adapter.select(target)?,
            Step::Write(data) => adapter::write_verified(adapter, data, StepKind::Write)?,
            Step::Read(buf) => {
                adapter.read_bytes(buf)?;
                last_received = Some(i);
            }
            Step::Exchange { out, input } => {
                if out.len() != input.len() {
                    return Err(Error::ProtocolViolation(format!(
                        "exchange of {} bytes into a {} byte buffer",
                        out.len(),
                        input.len()
                    )));
                }
                adapter.sendback_bytes(out, input)?;
                last_received = Some(i);
            }
            Step::Power { byte, delay } => {
                let echo = adapter.power_byte(*byte, *delay)?;
                if echo != *byte {
                    return Err(Error::transport(
                        StepKind::Power,
                        format!("echo mismatch: sent {byte:02X}, read {echo:02X}"),
                    ));
                }
            }
            Step::ProgramPulse => adapter.program_pulse()?,
            Step::Reset => {
                if adapter.reset()? == adapter::Presence::Empty {
                    return Err(Error::NotFound("no device answered reset".to_string()));
                }
            }
            Step::Verify(mode) => {
                let address = target.address.ok_or_else(|| {
                    Error::ProtocolViolation("verify needs a device address".to_string())
                })?;
                if !search::verify(adapter, address, *mode)? {
                    return Err(Error::NotFound(format!("{address} did not answer")));
                }
            }
            Step::Speed(speed) => adapter.set_overdrive(*speed)?,
            Step::Nop => {}
            Step::End => return Ok(()),
            // Checked above.
            Step::Crc8 | Step::Crc8Seeded(_) | Step::Crc16 | Step::Crc16Seeded(_) => {}
        }
    }
    Ok(())
}

fn check(checksum: Checksum, step: StepKind, data: &[u8]) -> Result<()> {
    match checksum {
        Checksum::Crc8(seed) => {
            let residue = crc8_seeded(data, seed);
            if residue != 0 {
                return Err(Error::ChecksumMismatch {
                    step,
                    residue: residue.into(),
                });
            }
        }
        Checksum::Crc16(seed) => {
            let residue = crc16_seeded(data, seed);
            if residue != CRC16_RESIDUE {
                return Err(Error::ChecksumMismatch { step, residue });
            }
        }
    }
    Ok(())
}
