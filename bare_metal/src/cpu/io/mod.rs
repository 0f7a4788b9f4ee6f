//! Provides primitive operations for working with the CPUs I/O ports

use core::arch::asm;
use core::ops;

pub mod com;

/// A CPU I/O port number.
#[derive(Debug, Eq, PartialEq, Copy, Clone, PartialOrd, Ord)]
pub struct PortNumber(pub u16);

impl ops::Add<u16> for PortNumber {
    type Output = PortNumber;

    fn add(self, offset: u16) -> PortNumber {
        PortNumber(self.0 + offset)
    }
}

// unsafe primitives

#[inline]
pub unsafe fn outb(port: PortNumber, data: u8) {
    asm!("out dx, al", in("dx") port.0, in("al") data, options(nomem, nostack, preserves_flags));
}

#[inline]
pub unsafe fn inb(port: PortNumber) -> u8 {
    let data: u8;
    asm!("in al, dx", out("al") data, in("dx") port.0, options(nomem, nostack, preserves_flags));
    data
}

/// Byte-wide access to I/O ports, so that drivers can be exercised without real ports.
pub trait PortAccess {
    fn read_u8(&mut self, port: PortNumber) -> u8;
    fn write_u8(&mut self, port: PortNumber, data: u8);
}

/// The I/O ports of the current CPU.
#[derive(Debug)]
pub struct NativePorts(());

impl NativePorts {
    /// The caller must make sure that the ports accessed through this handle
    /// belong to a device it owns exclusively.
    pub const unsafe fn new() -> NativePorts {
        NativePorts(())
    }
}

impl PortAccess for NativePorts {
    #[inline]
    fn read_u8(&mut self, port: PortNumber) -> u8 {
        unsafe { inb(port) }
    }

    #[inline]
    fn write_u8(&mut self, port: PortNumber, data: u8) {
        unsafe { outb(port, data) }
    }
}
