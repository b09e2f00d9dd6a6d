//! Simulated 1-Wire bus.
//!
//! The fake adapter models the wire itself: devices answer resets, ROM
//! commands and search slots with open-drain (wired-AND) semantics, and
//! each catalogued family answers its function commands from an in-memory
//! image. Tests keep a [`FakeHandle`] to inspect devices, inject faults,
//! and count how often the "hardware" was touched.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{rom, Adapter, AdapterFlags, AdapterKind, BusSpeed, Presence};
use crate::address::{Address, ADDRESS_BITS};
use crate::crc::{crc16_trailer, crc8};
use crate::device::{ds18s20, ds2401, ds2413, ds2431};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transaction::StepKind;

/// A simulated device.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    address: Address,
    alarm: bool,
    parasite: bool,
    temperature: f64,
    scratchpad: [u8; 9],
    register: [u8; 4],
    memory: Vec<u8>,
    eeprom: EepromScratch,
    pio_latch: [bool; 2],
    pio_input: [bool; 2],
    session: Session,
}

#[derive(Debug, Clone, Default)]
struct EepromScratch {
    target: u16,
    status: u8,
    data: [u8; 8],
}

/// Per-selection state, cleared by every reset.
#[derive(Debug, Clone, Default)]
struct Session {
    command: Option<u8>,
    position: usize,
    received: Vec<u8>,
    accepted: bool,
}

impl FakeDevice {
    pub fn new(address: Address) -> Self {
        let mut device = Self {
            address,
            alarm: false,
            parasite: false,
            temperature: 20.0,
            scratchpad: [0; 9],
            register: [0x01, 0x02, 0x00, 0x0B],
            memory: Vec::new(),
            eeprom: EepromScratch::default(),
            pio_latch: [true; 2],
            pio_input: [true; 2],
            session: Session::default(),
        };
        match address.family() {
            ds2401::FAMILY => {
                // 50 %RH, 21 C
                device.set_scratchpad([0x20, 0x03, 0x50, 0x01, 0, 0, 0, 0]);
            }
            ds18s20::FAMILY => {
                device.scratchpad = [0, 0, 0x4B, 0x46, 0xFF, 0xFF, 0, 0x10, 0];
                device.set_temperature(20.0);
            }
            ds2431::FAMILY => device.memory = vec![0; ds2431::MEMORY_SIZE],
            _ => {}
        }
        device
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn set_alarm(&mut self, alarm: bool) {
        self.alarm = alarm;
    }

    pub fn set_parasite(&mut self, parasite: bool) {
        self.parasite = parasite;
    }

    /// Set the sensed temperature and store it as if a conversion ran.
    pub fn set_temperature(&mut self, celsius: f64) {
        self.temperature = celsius;
        self.convert();
    }

    pub fn scratchpad(&self) -> &[u8; 9] {
        &self.scratchpad
    }

    /// Replace the first eight scratchpad bytes; the ninth becomes their CRC8.
    pub fn set_scratchpad(&mut self, data: [u8; 8]) {
        self.scratchpad[..8].copy_from_slice(&data);
        self.seal_scratchpad();
    }

    /// Overwrite all nine bytes, CRC included.
    pub fn set_raw_scratchpad(&mut self, data: [u8; 9]) {
        self.scratchpad = data;
    }

    pub fn set_functional_register(&mut self, register: [u8; 4]) {
        self.register = register;
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn set_memory(&mut self, offset: usize, data: &[u8]) {
        let end = (offset + data.len()).min(self.memory.len());
        if offset < end {
            self.memory[offset..end].copy_from_slice(&data[..end - offset]);
        }
    }

    /// Output latch of PIO `channel`; true means the transistor is off.
    pub fn pio_latch(&self, channel: usize) -> bool {
        self.pio_latch[channel]
    }

    /// Level an external circuit drives on PIO `channel`.
    pub fn set_pio_input(&mut self, channel: usize, level: bool) {
        self.pio_input[channel] = level;
    }

    fn seal_scratchpad(&mut self) {
        self.scratchpad[8] = crc8(&self.scratchpad[..8]);
    }

    fn convert(&mut self) {
        if self.address.family() != ds18s20::FAMILY {
            return;
        }
        // Invert the COUNT_REMAIN formula:
        // T = TEMP_READ - 0.25 + (COUNT_PER_C - COUNT_REMAIN) / COUNT_PER_C
        let t = self.temperature;
        let whole = (t + 0.25).ceil() - 1.0;
        let fraction = t + 0.25 - whole;
        let count_remain = (16.0 - (fraction * 16.0).round()).clamp(0.0, 16.0) as u8;
        let mut raw = (whole as i16) * 2;
        if t - whole >= 0.5 {
            raw += 1;
        }
        self.scratchpad[..2].copy_from_slice(&raw.to_le_bytes());
        self.scratchpad[6] = count_remain;
        self.scratchpad[7] = 0x10;
        self.seal_scratchpad();
    }

    fn status_byte(&self) -> u8 {
        let pin = |channel: usize| self.pio_latch[channel] && self.pio_input[channel];
        let low = u8::from(pin(0))
            | u8::from(self.pio_latch[0]) << 1
            | u8::from(pin(1)) << 2
            | u8::from(self.pio_latch[1]) << 3;
        low | (!low << 4)
    }

    /// Device side of one byte slot. Returns what the device drives; 0xFF
    /// means it leaves the bus alone.
    fn on_byte(&mut self, out: u8) -> u8 {
        let Some(command) = self.session.command else {
            self.session.command = Some(out);
            if self.address.family() == ds18s20::FAMILY && out == ds18s20::CONVERT_T {
                self.convert();
            }
            return 0xFF;
        };
        let position = self.session.position;
        self.session.position += 1;

        match self.address.family() {
            ds2401::FAMILY => self.tsh202(command, position, out),
            ds18s20::FAMILY => self.ds18s20(command, position, out),
            ds2431::FAMILY => self.ds2431(command, position, out),
            ds2413::FAMILY => self.ds2413(command, position, out),
            _ => 0xFF,
        }
    }

    fn tsh202(&mut self, command: u8, position: usize, out: u8) -> u8 {
        match command {
            ds2401::READ_SCRATCHPAD => self.scratchpad.get(position).copied().unwrap_or(0xFF),
            ds2401::WRITE_SCRATCHPAD => {
                if position < 2 {
                    self.scratchpad[4 + position] = out;
                    self.seal_scratchpad();
                }
                0xFF
            }
            ds2401::READ_FUNCTIONAL_REGISTER => self.register.get(position).copied().unwrap_or(0xFF),
            _ => 0xFF,
        }
    }

    fn ds18s20(&mut self, command: u8, position: usize, out: u8) -> u8 {
        match command {
            ds18s20::READ_SCRATCHPAD => self.scratchpad.get(position).copied().unwrap_or(0xFF),
            ds18s20::WRITE_SCRATCHPAD => {
                if position < 2 {
                    self.scratchpad[2 + position] = out;
                    self.seal_scratchpad();
                }
                0xFF
            }
            ds18s20::READ_POWER_SUPPLY => {
                if self.parasite {
                    0x00
                } else {
                    0xFF
                }
            }
            _ => 0xFF,
        }
    }

    fn ds2431(&mut self, command: u8, position: usize, out: u8) -> u8 {
        let target_of = |received: &[u8]| u16::from_le_bytes([received[0], received[1]]);

        match command {
            ds2431::READ_MEMORY => {
                if position < 2 {
                    self.session.received.push(out);
                    return 0xFF;
                }
                let start = target_of(&self.session.received) as usize;
                self.memory.get(start + position - 2).copied().unwrap_or(0xFF)
            }
            ds2431::WRITE_SCRATCHPAD => {
                if position < 2 {
                    self.session.received.push(out);
                    if position == 1 {
                        self.eeprom.target = target_of(&self.session.received);
                        self.eeprom.status &= !0x80;
                    }
                    return 0xFF;
                }
                let offset = usize::from(self.eeprom.target & 0x07);
                let count = 8 - offset;
                let index = position - 2;
                if index < count {
                    self.eeprom.data[offset + index] = out;
                    self.session.received.push(out);
                    if index + 1 == count {
                        self.eeprom.status = 0x07;
                    }
                    0xFF
                } else {
                    let mut message = vec![ds2431::WRITE_SCRATCHPAD];
                    message.extend_from_slice(&self.session.received);
                    crc16_trailer(&message).get(index - count).copied().unwrap_or(0xFF)
                }
            }
            ds2431::READ_SCRATCHPAD => {
                let mut frame = self.eeprom.target.to_le_bytes().to_vec();
                frame.push(self.eeprom.status);
                frame.extend_from_slice(&self.eeprom.data);
                let mut message = vec![ds2431::READ_SCRATCHPAD];
                message.extend_from_slice(&frame);
                frame.extend_from_slice(&crc16_trailer(&message));
                frame.get(position).copied().unwrap_or(0xFF)
            }
            ds2431::COPY_SCRATCHPAD => {
                if position < 3 {
                    self.session.received.push(out);
                    if position == 2 {
                        let mut expected = self.eeprom.target.to_le_bytes().to_vec();
                        expected.push(self.eeprom.status);
                        if self.session.received == expected {
                            let row = usize::from(self.eeprom.target & !0x07);
                            if row + 8 <= self.memory.len() {
                                self.memory[row..row + 8].copy_from_slice(&self.eeprom.data);
                            }
                            self.eeprom.status |= 0x80;
                            self.session.accepted = true;
                        }
                    }
                    return 0xFF;
                }
                if self.session.accepted {
                    ds2431::COPY_DONE
                } else {
                    0xFF
                }
            }
            _ => 0xFF,
        }
    }

    fn ds2413(&mut self, command: u8, position: usize, out: u8) -> u8 {
        match command {
            ds2413::PIO_ACCESS_READ => self.status_byte(),
            ds2413::PIO_ACCESS_WRITE => match position {
                0 => {
                    self.session.received.push(out);
                    0xFF
                }
                1 => {
                    if self.session.received.first() == Some(&!out) {
                        let data = !out;
                        self.pio_latch = [data & 0x01 != 0, data & 0x02 != 0];
                        self.session.accepted = true;
                    }
                    0xFF
                }
                2 if self.session.accepted => ds2413::WRITE_CONFIRM,
                _ if self.session.accepted => self.status_byte(),
                _ => 0xFF,
            },
            _ => 0xFF,
        }
    }
}

#[derive(Debug)]
enum Phase {
    /// No reset since power-up or since the last command ran out
    Idle,
    /// Reset seen; waiting for a ROM command
    Rom,
    Matching { bytes: [u8; 8], len: usize },
    ReadRom { position: usize },
    Search { bit: usize, slot: u8, participants: Vec<usize> },
    /// Function command phase for the selected devices
    Function(Vec<usize>),
}

#[derive(Debug)]
struct FakeBus {
    devices: Vec<FakeDevice>,
    phase: Phase,
    speed: BusSpeed,
    open: bool,
    fail_operations: u32,
    fail_detect: bool,
    corrupt_next_read: bool,
    operations: u64,
}

impl FakeBus {
    /// Account for one hardware operation, applying injected faults.
    fn operation(&mut self, step: StepKind) -> Result<()> {
        self.operations += 1;
        if !self.open {
            return Err(Error::transport(step, "fake adapter is closed"));
        }
        if self.fail_operations > 0 {
            self.fail_operations -= 1;
            return Err(Error::transport(step, "injected fault"));
        }
        Ok(())
    }

    fn reset(&mut self) -> Presence {
        for device in &mut self.devices {
            device.session = Session::default();
        }
        if self.devices.is_empty() {
            self.phase = Phase::Idle;
            Presence::Empty
        } else {
            self.phase = Phase::Rom;
            Presence::Devices
        }
    }

    fn select(&mut self, selected: Vec<usize>) {
        for &i in &selected {
            self.devices[i].session = Session::default();
        }
        self.phase = Phase::Function(selected);
    }

    fn exchange_byte(&mut self, out: u8) -> u8 {
        match &mut self.phase {
            Phase::Idle => out,
            Phase::Rom => {
                self.rom_command(out);
                out
            }
            Phase::Matching { bytes, len } => {
                bytes[*len] = out;
                *len += 1;
                if *len == bytes.len() {
                    let address = Address::new(*bytes);
                    let selected = self
                        .devices
                        .iter()
                        .position(|d| d.address == address)
                        .into_iter()
                        .collect();
                    self.select(selected);
                }
                out
            }
            Phase::ReadRom { position } => {
                let p = *position;
                *position += 1;
                self.devices
                    .iter()
                    .fold(out, |acc, d| acc & d.address.bytes().get(p).copied().unwrap_or(0xFF))
            }
            Phase::Search { .. } => (0..8).fold(0u8, |acc, bit| {
                let answer = self.exchange_bit(out >> bit & 1 == 1);
                acc | u8::from(answer) << bit
            }),
            Phase::Function(selected) => {
                let devices = &mut self.devices;
                selected
                    .iter()
                    .fold(out, |acc, &i| acc & devices[i].on_byte(out))
            }
        }
    }

    fn rom_command(&mut self, command: u8) {
        match command {
            rom::SEARCH | rom::ALARM_SEARCH => {
                let participants = self
                    .devices
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| command == rom::SEARCH || d.alarm)
                    .map(|(i, _)| i)
                    .collect();
                self.phase = Phase::Search {
                    bit: 0,
                    slot: 0,
                    participants,
                };
            }
            rom::MATCH | rom::OVERDRIVE_MATCH => {
                if command == rom::OVERDRIVE_MATCH {
                    self.speed = BusSpeed::Overdrive;
                }
                self.phase = Phase::Matching {
                    bytes: [0; 8],
                    len: 0,
                };
            }
            rom::SKIP | rom::OVERDRIVE_SKIP => {
                if command == rom::OVERDRIVE_SKIP {
                    self.speed = BusSpeed::Overdrive;
                }
                self.select((0..self.devices.len()).collect());
            }
            rom::READ => self.phase = Phase::ReadRom { position: 0 },
            _ => self.phase = Phase::Idle,
        }
    }

    fn exchange_bit(&mut self, out: bool) -> bool {
        let Phase::Search {
            bit,
            slot,
            participants,
        } = &mut self.phase
        else {
            return out;
        };
        let devices = &self.devices;
        let answer = match *slot {
            0 => out && participants.iter().all(|&i| devices[i].address.bit(*bit)),
            1 => out && participants.iter().all(|&i| !devices[i].address.bit(*bit)),
            _ => {
                participants.retain(|&i| devices[i].address.bit(*bit) == out);
                out
            }
        };
        *slot += 1;
        if *slot == 3 {
            *slot = 0;
            *bit += 1;
            if *bit == ADDRESS_BITS {
                let selected = std::mem::take(participants);
                self.select(selected);
            }
        }
        answer
    }
}

/// Adapter over a simulated bus.
#[derive(Debug)]
pub struct FakeAdapter {
    bus: Arc<Mutex<FakeBus>>,
}

/// Test-side view of a [`FakeAdapter`]'s bus. Clones share the bus.
#[derive(Debug, Clone)]
pub struct FakeHandle {
    bus: Arc<Mutex<FakeBus>>,
}

impl FakeAdapter {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            bus: Arc::new(Mutex::new(FakeBus {
                devices,
                phase: Phase::Idle,
                speed: BusSpeed::Regular,
                open: true,
                fail_operations: 0,
                fail_detect: false,
                corrupt_next_read: false,
                operations: 0,
            })),
        }
    }

    /// A bus of devices in their power-on state.
    pub fn with_addresses(addresses: &[Address]) -> Self {
        Self::new(addresses.iter().copied().map(FakeDevice::new).collect())
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl FakeHandle {
    /// Hardware operations performed so far (resets, byte and bit I/O).
    pub fn operations(&self) -> u64 {
        self.bus.lock().operations
    }

    /// Make the next `count` operations fail as transport errors.
    pub fn fail_operations(&self, count: u32) {
        self.bus.lock().fail_operations = count;
    }

    /// Make `detect` (and therefore reconnect) fail.
    pub fn fail_detect(&self, fail: bool) {
        self.bus.lock().fail_detect = fail;
    }

    /// Flip the low bit of the first byte of the next read.
    pub fn corrupt_next_read(&self) {
        self.bus.lock().corrupt_next_read = true;
    }

    pub fn is_open(&self) -> bool {
        self.bus.lock().open
    }

    pub fn speed(&self) -> BusSpeed {
        self.bus.lock().speed
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.bus.lock().devices.push(device);
    }

    pub fn remove_device(&self, address: Address) {
        let mut bus = self.bus.lock();
        bus.devices.retain(|d| d.address != address);
        bus.phase = Phase::Idle;
    }

    /// Run `f` on the device at `address`, if it is on the bus.
    pub fn with_device<R>(&self, address: Address, f: impl FnOnce(&mut FakeDevice) -> R) -> Option<R> {
        let mut bus = self.bus.lock();
        bus.devices.iter_mut().find(|d| d.address == address).map(f)
    }
}

impl Adapter for FakeAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Fake
    }

    fn name(&self) -> &str {
        "fake"
    }

    fn flags(&self) -> AdapterFlags {
        AdapterFlags::OVERDRIVE
    }

    fn detect(&mut self) -> Result<()> {
        let mut bus = self.bus.lock();
        if bus.fail_detect {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "fake adapter did not answer",
            )));
        }
        bus.open = true;
        bus.phase = Phase::Idle;
        bus.speed = BusSpeed::Regular;
        debug!(devices = bus.devices.len(), "fake bus detected");
        Ok(())
    }

    fn reset(&mut self) -> Result<Presence> {
        let mut bus = self.bus.lock();
        bus.operation(StepKind::Reset)?;
        Ok(bus.reset())
    }

    fn sendback_bytes(&mut self, data: &[u8], resp: &mut [u8]) -> Result<()> {
        let mut bus = self.bus.lock();
        bus.operation(StepKind::Exchange)?;
        for (out, slot) in data.iter().zip(resp.iter_mut()) {
            *slot = bus.exchange_byte(*out);
        }
        Ok(())
    }

    fn sendback_bits(&mut self, bits: &[bool], resp: &mut [bool]) -> Result<()> {
        let mut bus = self.bus.lock();
        bus.operation(StepKind::Exchange)?;
        for (out, slot) in bits.iter().zip(resp.iter_mut()) {
            *slot = bus.exchange_bit(*out);
        }
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut bus = self.bus.lock();
        bus.operation(StepKind::Read)?;
        for slot in buf.iter_mut() {
            *slot = bus.exchange_byte(0xFF);
        }
        if bus.corrupt_next_read {
            bus.corrupt_next_read = false;
            if let Some(first) = buf.first_mut() {
                *first ^= 0x01;
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.bus.lock().open = false;
    }

    fn speed(&self) -> BusSpeed {
        self.bus.lock().speed
    }

    fn set_overdrive(&mut self, speed: BusSpeed) -> Result<()> {
        self.bus.lock().speed = speed;
        Ok(())
    }

    fn probe_overdrive(&mut self) -> Result<bool> {
        let mut bus = self.bus.lock();
        bus.operation(StepKind::Speed)?;
        Ok(!bus.devices.is_empty())
    }

    // No strong pull-up to hold and no conversion time to wait out.
    fn power_byte(&mut self, byte: u8, _delay: Duration) -> Result<u8> {
        let mut bus = self.bus.lock();
        bus.operation(StepKind::Power)?;
        Ok(bus.exchange_byte(byte))
    }

    fn program_pulse(&mut self) -> Result<()> {
        self.bus.lock().operation(StepKind::ProgramPulse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Target;

    fn sensor(serial: u8) -> FakeDevice {
        FakeDevice::new(Address::from_family_serial(ds18s20::FAMILY, [serial, 0, 0, 0, 0, 0]))
    }

    #[test]
    fn test_reset_presence() {
        let mut adapter = FakeAdapter::new(vec![]);
        assert_eq!(adapter.reset().unwrap(), Presence::Empty);
        adapter.handle().add_device(sensor(1));
        assert_eq!(adapter.reset().unwrap(), Presence::Devices);
    }

    #[test]
    fn test_read_rom_single_device() {
        let device = sensor(7);
        let address = device.address();
        let mut adapter = FakeAdapter::new(vec![device]);

        adapter.reset().unwrap();
        let mut echo = [0u8];
        adapter.sendback_bytes(&[rom::READ], &mut echo).unwrap();
        let mut rom_code = [0u8; 8];
        adapter.read_bytes(&mut rom_code).unwrap();
        assert_eq!(Address::new(rom_code), address);
    }

    #[test]
    fn test_unselected_device_stays_silent() {
        let device = sensor(1);
        let other = Address::from_family_serial(ds18s20::FAMILY, [2, 0, 0, 0, 0, 0]);
        let mut adapter = FakeAdapter::new(vec![device]);

        adapter.select(&Target::device(other)).unwrap();
        let mut echo = [0u8];
        adapter.sendback_bytes(&[ds18s20::READ_SCRATCHPAD], &mut echo).unwrap();
        let mut data = [0u8; 9];
        adapter.read_bytes(&mut data).unwrap();
        assert_eq!(data, [0xFF; 9]);
    }

    #[test]
    fn test_convert_encodes_count_remain() {
        let mut device = sensor(1);
        device.set_temperature(25.0);
        assert_eq!(&device.scratchpad()[..2], &[50, 0]);
        assert_eq!(device.scratchpad()[6], 12);
        assert_eq!(crc8(device.scratchpad()), 0);

        device.set_temperature(-10.125);
        // TEMP_READ is -10 once the half-degree bit is shifted out.
        assert_eq!(i16::from_le_bytes([device.scratchpad()[0], device.scratchpad()[1]]), -19);
        assert_eq!(device.scratchpad()[6], 14);
    }

    #[test]
    fn test_status_byte_complement() {
        let mut device = FakeDevice::new(Address::from_family_serial(ds2413::FAMILY, [1, 0, 0, 0, 0, 0]));
        assert_eq!(device.status_byte(), 0x0F);
        device.set_pio_input(1, false);
        let status = device.status_byte();
        assert_eq!(status & 0x0F, 0b1011);
        assert_eq!(status >> 4, !status & 0x0F);
    }

    #[test]
    fn test_injected_faults_count_down() {
        let mut adapter = FakeAdapter::new(vec![sensor(1)]);
        let handle = adapter.handle();
        handle.fail_operations(2);

        assert!(adapter.reset().unwrap_err().is_transport());
        assert!(adapter.reset().unwrap_err().is_transport());
        assert_eq!(adapter.reset().unwrap(), Presence::Devices);
        assert_eq!(handle.operations(), 3);
    }

    #[test]
    fn test_closed_adapter_fails_until_detected() {
        let mut adapter = FakeAdapter::new(vec![sensor(1)]);
        let handle = adapter.handle();

        adapter.close();
        assert!(!handle.is_open());
        assert!(adapter.reset().is_err());

        handle.fail_detect(true);
        assert!(adapter.reconnect().is_err());
        handle.fail_detect(false);
        adapter.reconnect().unwrap();
        assert_eq!(adapter.reset().unwrap(), Presence::Devices);
    }

    #[test]
    fn test_overdrive_match_switches_speed() {
        let device = sensor(1);
        let address = device.address();
        let mut adapter = FakeAdapter::new(vec![device]);
        let handle = adapter.handle();

        adapter.set_overdrive(BusSpeed::Overdrive).unwrap();
        adapter.select(&Target::device(address)).unwrap();
        assert_eq!(handle.speed(), BusSpeed::Overdrive);
        assert!(adapter.probe_overdrive().unwrap());
    }
}
