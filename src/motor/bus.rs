// Bus transport used by the MD20 driver
//
// The driver only needs "read N bytes at offset" and "write bytes at
// offset" against one target address. `I2cTransport` provides both on top
// of any embedded-hal 1.0 I2C master, including `linux_embedded_hal::I2cdev`.

use embedded_hal::i2c::I2c;

/// Error produced by a transport, kept opaque so it can be propagated unchanged
pub type TransportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Synchronous register access over a shared two-wire bus
pub trait RegisterBus {
    /// Read `buf.len()` bytes starting at `offset`
    fn read(&mut self, address: u8, offset: u8, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Write `bytes` starting at `offset`
    fn write(&mut self, address: u8, offset: u8, bytes: &[u8]) -> Result<(), TransportError>;
}

impl<T: RegisterBus + ?Sized> RegisterBus for &mut T {
    fn read(&mut self, address: u8, offset: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read(address, offset, buf)
    }

    fn write(&mut self, address: u8, offset: u8, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(address, offset, bytes)
    }
}

/// Longest single write: offset byte + the largest command record
const MAX_WRITE: usize = 32;

/// Register access over an embedded-hal I2C master
///
/// A write is one transaction `[offset, bytes...]`; a read writes the
/// offset and reads back with a repeated start.
pub struct I2cTransport<I> {
    i2c: I,
}

impl<I> I2cTransport<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn inner(&self) -> &I {
        &self.i2c
    }

    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.i2c
    }

    pub fn into_inner(self) -> I {
        self.i2c
    }
}

impl<I> RegisterBus for I2cTransport<I>
where
    I: I2c,
    I::Error: std::error::Error + Send + Sync + 'static,
{
    fn read(&mut self, address: u8, offset: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        self.i2c.write_read(address, &[offset], buf)?;
        Ok(())
    }

    fn write(&mut self, address: u8, offset: u8, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() >= MAX_WRITE {
            return Err(format!(
                "write of {} bytes exceeds the {} byte frame",
                bytes.len(),
                MAX_WRITE - 1
            )
            .into());
        }
        let mut frame = [0u8; MAX_WRITE];
        frame[0] = offset;
        frame[1..=bytes.len()].copy_from_slice(bytes);
        self.i2c.write(address, &frame[..=bytes.len()])?;
        Ok(())
    }
}
