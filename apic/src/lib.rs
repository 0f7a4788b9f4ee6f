//! Driver for the local APIC, the per-processor interrupt controller.
//!
//! Only the xAPIC mode is supported, and only the parts needed for a single timer vector
//! and for waking up the other processors.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

mod registers;
mod lapic;

pub mod ipi;
pub mod pit;
pub mod timer;

pub use self::registers::*;
pub use self::lapic::*;

use core::fmt;

/// The identifier of an APIC.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Copy, Clone, Default, Hash)]
pub struct ApicId(pub u8);

impl fmt::Display for ApicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    use super::{Register, RegisterAccess};

    /// Register file in plain memory that remembers every write.
    #[derive(Default)]
    pub struct FakeRegisters {
        pub values: RefCell<HashMap<usize, u32>>,
        pub writes: RefCell<Vec<(Register, u32)>>,
        pub msr: Cell<u64>,
    }

    impl FakeRegisters {
        pub fn value(&self, reg: Register) -> u32 {
            self.read_reg(reg)
        }

        pub fn set(&self, reg: Register, value: u32) {
            self.values.borrow_mut().insert(reg.offset(), value);
        }
    }

    impl RegisterAccess for FakeRegisters {
        fn read_reg(&self, reg: Register) -> u32 {
            self.values.borrow().get(&reg.offset()).copied().unwrap_or(0)
        }

        fn write_reg(&self, reg: Register, value: u32) {
            self.writes.borrow_mut().push((reg, value));
            self.values.borrow_mut().insert(reg.offset(), value);
        }

        fn read_base_msr(&self) -> u64 {
            self.msr.get()
        }

        fn write_base_msr(&self, value: u64) {
            self.msr.set(value)
        }
    }

    impl RegisterAccess for &FakeRegisters {
        fn read_reg(&self, reg: Register) -> u32 {
            (**self).read_reg(reg)
        }

        fn write_reg(&self, reg: Register, value: u32) {
            (**self).write_reg(reg, value)
        }

        fn read_base_msr(&self) -> u64 {
            (**self).read_base_msr()
        }

        fn write_base_msr(&self, value: u64) {
            (**self).write_base_msr(value)
        }
    }
}
