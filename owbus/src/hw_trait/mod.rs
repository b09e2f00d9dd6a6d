//! Hardware abstraction layer traits.
//!
//! Bridge-chip drivers talk to their host bus through these traits so the
//! same driver runs over a Linux i2c-dev node, a USB-to-I2C dongle, or a
//! scripted mock in tests.

use std::io;

/// Blocking I2C master.
///
/// Addresses are 7-bit. Each call is one bus transaction; `write_read` uses
/// a repeated start between the two halves.
pub trait I2c: Send {
    fn write(&mut self, address: u8, bytes: &[u8]) -> io::Result<()>;

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> io::Result<()>;

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()> {
        self.write(address, bytes)?;
        self.read(address, buffer)
    }
}

impl<T: I2c + ?Sized> I2c for Box<T> {
    fn write(&mut self, address: u8, bytes: &[u8]) -> io::Result<()> {
        (**self).write(address, bytes)
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> io::Result<()> {
        (**self).read(address, buffer)
    }

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> io::Result<()> {
        (**self).write_read(address, bytes, buffer)
    }
}
