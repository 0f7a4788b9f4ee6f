use core::sync::atomic::{AtomicPtr, Ordering};

use bare_metal::cpu::Msr;
use bare_metal::{IsAligned, VirtAddr, PAGE_SIZE};

/// Offset of a 32 bit register in the memory mapped local APIC page.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Hash)]
pub struct Register(usize);

impl Register {
    pub const ID: Register = Register(0x20);
    pub const EOI: Register = Register(0xB0);
    pub const SPURIOUS_INTERRUPT_VECTOR: Register = Register(0xF0);
    pub const ICR_LOW: Register = Register(0x300);
    pub const ICR_HIGH: Register = Register(0x310);
    pub const LVT_TIMER: Register = Register(0x320);
    pub const TIMER_INITIAL_COUNT: Register = Register(0x380);
    pub const TIMER_CURRENT_COUNT: Register = Register(0x390);
    pub const TIMER_DIVIDE_CONFIG: Register = Register(0x3E0);

    /// Byte offset from the start of the register page.
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// Typed access to the local APIC of the current processor.
///
/// Implementations are the only place where the hardware is touched, everything built on top
/// of this trait is ordinary code.
pub trait RegisterAccess {
    fn read_reg(&self, reg: Register) -> u32;

    fn write_reg(&self, reg: Register, value: u32);

    /// Read the `IA32_APIC_BASE` model specific register.
    fn read_base_msr(&self) -> u64;

    /// Write the `IA32_APIC_BASE` model specific register.
    fn write_base_msr(&self, value: u64);
}

/// Interface to the local APIC via the memory mapped registers.
pub struct MmioRegisters(AtomicPtr<u32>);

impl MmioRegisters {
    /// Access the registers mapped at `base`.
    ///
    /// The page at `base` must be mapped uncached to the local APIC before any register is used,
    /// and it must stay mapped for as long as this value exists.
    pub unsafe fn new(base: VirtAddr) -> MmioRegisters {
        assert!(base.0.is_aligned(PAGE_SIZE), "APIC register base address not aligned");
        MmioRegisters(AtomicPtr::new(base.as_mut_ptr()))
    }

    #[inline(always)]
    fn reg_ptr(&self, reg: Register) -> *mut u32 {
        assert!(reg.offset().is_aligned(16), "misaligned APIC register index");
        self.0.load(Ordering::Relaxed).wrapping_add(reg.offset() >> 2)
    }
}

impl RegisterAccess for MmioRegisters {
    #[inline(always)]
    fn read_reg(&self, reg: Register) -> u32 {
        unsafe { self.reg_ptr(reg).read_volatile() }
    }

    #[inline(always)]
    fn write_reg(&self, reg: Register, value: u32) {
        unsafe { self.reg_ptr(reg).write_volatile(value) }
    }

    fn read_base_msr(&self) -> u64 {
        unsafe { Msr::APIC_BASE.read() }
    }

    fn write_base_msr(&self, value: u64) {
        unsafe { Msr::APIC_BASE.write(value) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mmio_offsets() {
        let mut page = vec![0_u32; PAGE_SIZE / 4];
        // a Vec is not page aligned, so go through the pointer arithmetic by hand
        let regs = MmioRegisters(AtomicPtr::new(page.as_mut_ptr()));
        regs.write_reg(Register::TIMER_DIVIDE_CONFIG, 0b1011);
        regs.write_reg(Register::ID, 0x0300_0000);
        assert_eq!(page[0x3E0 / 4], 0b1011);
        assert_eq!(regs.read_reg(Register::ID), 0x0300_0000);
    }
}
