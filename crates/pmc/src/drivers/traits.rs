//! Hardware capability traits
//!
//! Trait seams between the core logic and the hardware it drives. Production
//! implementations sit on MMIO register banks and the vendor I2C controller;
//! the `mock` module provides behavioral models for hosted tests.

use alloc::sync::Arc;

use crate::drivers::PmcResult;

/// A `(offset) -> u32` register window over one PL IP.
///
/// Offsets are byte offsets from the IP's base address. Callers validate
/// channel/zone/pin indices before forming an offset.
pub trait RegisterIo: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for &T {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}

/// Byte-addressed paged EEPROM.
///
/// `write` returns the number of bytes actually committed; a short write is
/// a device failure, not a partial-success contract.
pub trait Eeprom: Send + Sync {
    /// Atomic write unit of the device in bytes.
    fn page_size(&self) -> usize;

    /// Total device size in bytes.
    fn total_size(&self) -> usize;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: usize, buf: &mut [u8]) -> PmcResult<()>;

    /// Write `data` starting at `addr`, returning bytes written.
    fn write(&self, addr: usize, data: &[u8]) -> usize;
}

impl<T: Eeprom + ?Sized> Eeprom for Arc<T> {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }
    fn total_size(&self) -> usize {
        (**self).total_size()
    }
    fn read(&self, addr: usize, buf: &mut [u8]) -> PmcResult<()> {
        (**self).read(addr, buf)
    }
    fn write(&self, addr: usize, data: &[u8]) -> usize {
        (**self).write(addr, data)
    }
}

/// The half of an I2C controller the IPMB transceiver drives.
///
/// Mirrors the PS I2C programming model: the device is either a master or a
/// slave, switching requires a controller reset, and all completion events
/// arrive through the interrupt path (`IpmbTransceiver::handle_status`).
pub trait I2cStation: Send + Sync {
    /// Whether a transfer is currently holding the bus.
    fn bus_is_busy(&self) -> bool;

    /// Reset the controller, aborting any transfer in flight.
    fn reset(&self);

    /// Program the serial clock rate.
    fn set_clock_hz(&self, hz: u32);

    /// Enter slave mode listening on `own_addr` (7-bit).
    fn setup_slave(&self, own_addr: u8);

    /// Post a receive window of `max_len` bytes in slave mode.
    fn slave_receive(&self, max_len: usize);

    /// Begin a master transmit of `bytes` to `slave_addr` (7-bit).
    fn master_send(&self, bytes: &[u8], slave_addr: u8);
}

/// Anything that can produce a raw ADC sample for one sensor channel.
///
/// Invoked from the sensor processor interrupt handler, so implementations
/// must be bounded: no blocking, no allocation.
pub trait AdcReadout: Send + Sync {
    fn read_raw(&self) -> u16;
}

impl<F> AdcReadout for F
where
    F: Fn() -> u16 + Send + Sync,
{
    fn read_raw(&self) -> u16 {
        self()
    }
}

/// A watchdog slot that must be serviced periodically.
pub trait WatchdogSlot: Send + Sync {
    fn service(&self);
}
