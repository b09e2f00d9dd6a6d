//! DS2482-100/800 I2C to 1-Wire bridge driver.
//!
//! The -100 drives one 1-Wire bus, the -800 eight. Every channel is its own
//! adapter (and its own connection), but they share one chip and its single
//! set of registers, so the chip sits behind a mutex and a channel selects
//! itself before each primitive.
//!
//! Datasheets:
//! - <https://www.analog.com/media/en/technical-documentation/data-sheets/DS2482-100.pdf>
//! - <https://www.analog.com/media/en/technical-documentation/data-sheets/DS2482-800.pdf>

use modular_bitfield::prelude::*;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use super::{rom, Adapter, AdapterFlags, AdapterKind, BusSpeed, Presence};
use crate::address::{Address, ADDRESS_BITS};
use crate::error::{Error, Result};
use crate::hw_trait::I2c;
use crate::search::DeviceSearch;
use crate::tracing::prelude::*;
use crate::transaction::StepKind;

/// Address with AD0..AD2 strapped low.
pub const DEFAULT_ADDRESS: u8 = 0x18;

/// Bridge command codes.
pub mod commands {
    pub const DEVICE_RESET: u8 = 0xF0;
    pub const SET_READ_POINTER: u8 = 0xE1;
    pub const WRITE_CONFIG: u8 = 0xD2;
    pub const CHANNEL_SELECT: u8 = 0xC3;
    pub const ONE_WIRE_RESET: u8 = 0xB4;
    pub const SINGLE_BIT: u8 = 0x87;
    pub const WRITE_BYTE: u8 = 0xA5;
    pub const READ_BYTE: u8 = 0x96;
    pub const TRIPLET: u8 = 0x78;
}

/// Register codes for `SET_READ_POINTER`.
pub mod pointer {
    pub const STATUS: u8 = 0xF0;
    pub const DATA: u8 = 0xE1;
    pub const CHANNEL: u8 = 0xD2;
    pub const CONFIG: u8 = 0xC3;
}

/// (select code, read-back code) per channel on the -800.
const CHANNEL_CODES: [(u8, u8); 8] = [
    (0xF0, 0xB8),
    (0xE1, 0xB1),
    (0xD2, 0xAA),
    (0xC3, 0xA3),
    (0xB4, 0x9C),
    (0xA5, 0x95),
    (0x96, 0x8E),
    (0x87, 0x87),
];

/// Status polls before a command is declared stuck. At 400 kHz one poll is
/// about 25us, well beyond the longest (reset) operation.
const POLL_LIMIT: usize = 100;

/// Status register.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct Status {
    /// 1-Wire busy
    pub busy: bool,
    /// Presence pulse detected
    pub presence: bool,
    /// Short detected
    pub short: bool,
    /// Logic level of the bus
    pub logic_level: bool,
    /// Device reset since last config write
    pub device_reset: bool,
    /// Single bit result
    pub single_bit: bool,
    /// Triplet second bit
    pub triplet_second: bool,
    /// Branch direction taken
    pub branch_direction: bool,
}

/// Configuration register, lower nibble.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct ChipConfig {
    pub active_pullup: bool,
    pub presence_mask: bool,
    pub strong_pullup: bool,
    pub overdrive: bool,
    #[skip]
    __: B4,
}

impl ChipConfig {
    /// Register byte as written: the upper nibble is the complement.
    fn wire_byte(self) -> u8 {
        let low = self.into_bytes()[0] & 0x0F;
        low | (!low << 4)
    }
}

fn io_failure(step: StepKind) -> impl FnOnce(io::Error) -> Error {
    move |e| Error::transport(step, format!("DS2482: {e}"))
}

/// One DS2482 and its register state.
pub struct Ds2482Chip {
    i2c: Box<dyn I2c>,
    address: u8,
    channels: u8,
    selected: Option<u8>,
    config: ChipConfig,
}

impl Ds2482Chip {
    /// Reset the chip and work out which variant it is.
    pub fn open(i2c: Box<dyn I2c>, address: u8) -> Result<Arc<Mutex<Self>>> {
        let mut chip = Self {
            i2c,
            address,
            channels: 1,
            selected: None,
            config: ChipConfig::new(),
        };
        chip.device_reset()?;

        // Only the -800 understands channel select.
        let (code, readback) = CHANNEL_CODES[0];
        if chip.i2c.write(address, &[commands::CHANNEL_SELECT, code]).is_ok() {
            let mut value = [0u8];
            chip.i2c
                .read(address, &mut value)
                .map_err(io_failure(StepKind::Select))?;
            if value[0] == readback {
                chip.channels = 8;
                chip.selected = Some(0);
            }
        }
        debug!(
            i2c_address = format_args!("0x{address:02X}"),
            model = chip.model(),
            "DS2482 detected"
        );
        Ok(Arc::new(Mutex::new(chip)))
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn model(&self) -> &'static str {
        if self.channels == 8 {
            "DS2482-800"
        } else {
            "DS2482-100"
        }
    }

    fn device_reset(&mut self) -> Result<()> {
        self.i2c
            .write(self.address, &[commands::DEVICE_RESET])
            .map_err(io_failure(StepKind::Reset))?;
        let status = self.read_register(StepKind::Reset)?;
        if !Status::from_bytes([status]).device_reset() {
            return Err(Error::transport(StepKind::Reset, "DS2482 did not report reset"));
        }
        self.selected = None;
        self.config = ChipConfig::new();
        Ok(())
    }

    fn read_register(&mut self, step: StepKind) -> Result<u8> {
        let mut value = [0u8];
        self.i2c.read(self.address, &mut value).map_err(io_failure(step))?;
        Ok(value[0])
    }

    fn select_channel(&mut self, channel: u8) -> Result<()> {
        if self.channels == 1 || self.selected == Some(channel) {
            return Ok(());
        }
        let (code, readback) = CHANNEL_CODES
            .get(usize::from(channel))
            .copied()
            .ok_or_else(|| Error::Config(format!("DS2482 has no channel {channel}")))?;
        self.i2c
            .write(self.address, &[commands::CHANNEL_SELECT, code])
            .map_err(io_failure(StepKind::Select))?;
        let value = self.read_register(StepKind::Select)?;
        if value != readback {
            self.selected = None;
            return Err(Error::transport(
                StepKind::Select,
                format!("channel {channel} read back 0x{value:02X}"),
            ));
        }
        self.selected = Some(channel);
        Ok(())
    }

    fn write_config(&mut self, config: ChipConfig) -> Result<()> {
        self.i2c
            .write(self.address, &[commands::WRITE_CONFIG, config.wire_byte()])
            .map_err(io_failure(StepKind::Speed))?;
        let value = self.read_register(StepKind::Speed)?;
        if value != config.into_bytes()[0] & 0x0F {
            return Err(Error::transport(
                StepKind::Speed,
                format!("config read back 0x{value:02X}"),
            ));
        }
        self.config = config;
        Ok(())
    }

    /// Issue a 1-Wire command and poll until the bridge is idle.
    fn command(&mut self, bytes: &[u8], step: StepKind) -> Result<Status> {
        self.i2c.write(self.address, bytes).map_err(io_failure(step))?;
        for _ in 0..POLL_LIMIT {
            let status = Status::from_bytes([self.read_register(step)?]);
            if !status.busy() {
                return Ok(status);
            }
        }
        Err(Error::transport(step, "DS2482 stayed busy"))
    }

    fn read_data(&mut self, step: StepKind) -> Result<u8> {
        let mut value = [0u8];
        self.i2c
            .write_read(
                self.address,
                &[commands::SET_READ_POINTER, pointer::DATA],
                &mut value,
            )
            .map_err(io_failure(step))?;
        Ok(value[0])
    }
}

/// One 1-Wire channel of a DS2482.
pub struct Ds2482Channel {
    chip: Arc<Mutex<Ds2482Chip>>,
    channel: u8,
    model: &'static str,
    speed: BusSpeed,
}

impl Ds2482Channel {
    /// An adapter for every channel the chip has.
    pub fn all(chip: &Arc<Mutex<Ds2482Chip>>) -> Vec<Self> {
        let (channels, model) = {
            let chip = chip.lock();
            (chip.channels(), chip.model())
        };
        (0..channels)
            .map(|channel| Self {
                chip: Arc::clone(chip),
                channel,
                model,
                speed: BusSpeed::Regular,
            })
            .collect()
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Lock the chip with this channel selected and its speed applied.
    fn with_chip<R>(&self, f: impl FnOnce(&mut Ds2482Chip) -> Result<R>) -> Result<R> {
        let mut chip = self.chip.lock();
        chip.select_channel(self.channel)?;
        let overdrive = self.speed == BusSpeed::Overdrive;
        if chip.config.overdrive() != overdrive {
            let config = chip.config.with_overdrive(overdrive);
            chip.write_config(config)?;
        }
        f(&mut chip)
    }

    fn bus_reset(chip: &mut Ds2482Chip) -> Result<Presence> {
        let status = chip.command(&[commands::ONE_WIRE_RESET], StepKind::Reset)?;
        if status.short() {
            return Err(Error::transport(StepKind::Reset, "short circuit on 1-Wire bus"));
        }
        Ok(if status.presence() {
            Presence::Devices
        } else {
            Presence::Empty
        })
    }

    fn write_byte(chip: &mut Ds2482Chip, byte: u8, step: StepKind) -> Result<()> {
        chip.command(&[commands::WRITE_BYTE, byte], step)?;
        Ok(())
    }

    fn read_byte(chip: &mut Ds2482Chip, step: StepKind) -> Result<u8> {
        chip.command(&[commands::READ_BYTE], step)?;
        chip.read_data(step)
    }
}

impl Adapter for Ds2482Channel {
    fn kind(&self) -> AdapterKind {
        AdapterKind::I2c
    }

    fn name(&self) -> &str {
        self.model
    }

    fn flags(&self) -> AdapterFlags {
        AdapterFlags::OVERDRIVE
    }

    fn detect(&mut self) -> Result<()> {
        self.speed = BusSpeed::Regular;
        self.with_chip(|chip| {
            let config = chip.config.with_active_pullup(true).with_strong_pullup(false);
            chip.write_config(config)
        })
    }

    fn reset(&mut self) -> Result<Presence> {
        self.with_chip(Self::bus_reset)
    }

    /// A 0xFF byte is a read slot; anything else is written and assumed to
    /// echo unchanged, since the bridge does not report what it saw.
    fn sendback_bytes(&mut self, data: &[u8], resp: &mut [u8]) -> Result<()> {
        self.with_chip(|chip| {
            for (out, slot) in data.iter().zip(resp.iter_mut()) {
                *slot = if *out == 0xFF {
                    Self::read_byte(chip, StepKind::Exchange)?
                } else {
                    Self::write_byte(chip, *out, StepKind::Exchange)?;
                    *out
                };
            }
            Ok(())
        })
    }

    fn sendback_bits(&mut self, bits: &[bool], resp: &mut [bool]) -> Result<()> {
        self.with_chip(|chip| {
            for (out, slot) in bits.iter().zip(resp.iter_mut()) {
                let arg = if *out { 0x80 } else { 0x00 };
                let status = chip.command(&[commands::SINGLE_BIT, arg], StepKind::Exchange)?;
                *slot = status.single_bit();
            }
            Ok(())
        })
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.with_chip(|chip| {
            for slot in buf.iter_mut() {
                *slot = Self::read_byte(chip, StepKind::Read)?;
            }
            Ok(())
        })
    }

    fn close(&mut self) {
        trace!(channel = self.channel, "DS2482 channel closed");
    }

    fn speed(&self) -> BusSpeed {
        self.speed
    }

    fn set_overdrive(&mut self, speed: BusSpeed) -> Result<()> {
        self.speed = speed;
        self.with_chip(|_| Ok(()))
    }

    /// Switch every device to overdrive, see whether anything answers at
    /// that speed, then drop back with a regular-speed reset.
    fn probe_overdrive(&mut self) -> Result<bool> {
        self.speed = BusSpeed::Regular;
        let answered = self.with_chip(|chip| {
            if Self::bus_reset(chip)? == Presence::Empty {
                return Ok(false);
            }
            Self::write_byte(chip, rom::OVERDRIVE_SKIP, StepKind::Speed)?;
            chip.write_config(chip.config.with_overdrive(true))?;
            let answered = Self::bus_reset(chip)? == Presence::Devices;
            chip.write_config(chip.config.with_overdrive(false))?;
            Self::bus_reset(chip)?;
            Ok(answered)
        })?;
        debug!(channel = self.channel, answered, "overdrive probe");
        Ok(answered)
    }

    fn power_byte(&mut self, byte: u8, delay: Duration) -> Result<u8> {
        self.with_chip(|chip| {
            chip.write_config(chip.config.with_strong_pullup(true))?;
            Self::write_byte(chip, byte, StepKind::Power)?;
            std::thread::sleep(delay);
            chip.write_config(chip.config.with_strong_pullup(false))?;
            Ok(byte)
        })
    }

    /// Search using the bridge's triplet command: both read slots and the
    /// direction write in one I2C exchange.
    fn search_next(&mut self, search: &mut DeviceSearch) -> Result<Option<Address>> {
        if !search.begin_pass() {
            return Ok(None);
        }
        self.with_chip(|chip| {
            if Self::bus_reset(chip)? == Presence::Empty {
                search.exhaust();
                return Ok(None);
            }
            Self::write_byte(chip, search.mode().command(), StepKind::Write)?;

            let mut pass_zero = None;
            for bit in 0..ADDRESS_BITS {
                let arg = if search.preferred(bit) { 0x80 } else { 0x00 };
                let status = chip.command(&[commands::TRIPLET, arg], StepKind::Exchange)?;
                let Some(direction) = search.resolve(
                    bit,
                    status.single_bit(),
                    status.triplet_second(),
                    &mut pass_zero,
                )?
                else {
                    return Ok(None);
                };
                if direction != status.branch_direction() {
                    return Err(Error::ProtocolViolation(format!(
                        "DS2482 took branch {} at bit {bit}, expected {direction}",
                        status.branch_direction()
                    )));
                }
            }
            search.finish_pass(pass_zero)
        })
    }
}
