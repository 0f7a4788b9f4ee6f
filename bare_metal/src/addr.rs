//! Newtype wrappers that make it harder to accidentally confuse physical and virtual addresses.

use core::fmt;
use core::ops;

use super::align::Alignable;

/// Size of a normal page, 4096 bytes.
pub const PAGE_SIZE: usize = 4096;

/// A virtual address. It's validity depends on the current page mapping.
#[repr(C)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct VirtAddr(pub usize);

/// A physical address. Whether it is accessible depends on the current page mapping.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
#[repr(C)]
pub struct PhysAddr(pub usize);

impl VirtAddr {
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl PhysAddr {
    /// The number of the 4K page containing this address.
    pub fn page_number(self) -> usize {
        self.0 / PAGE_SIZE
    }

    /// Identity-map this address into the virtual address space.
    ///
    /// Only meaningful for regions that are actually mapped 1:1, like the local APIC
    /// registers or the low memory used for the AP trampoline.
    pub fn identity(self) -> VirtAddr {
        VirtAddr(self.0)
    }
}

macro_rules! impl_addr_arith {
    ($addr:tt) => {
        impl Alignable for $addr {
            type Alignment = usize;

            fn align_up(self, alignment: usize) -> Self {
                $addr(self.0.align_up(alignment))
            }

            fn align_down(self, alignment: usize) -> Self {
                $addr(self.0.align_down(alignment))
            }
        }

        impl ops::Add<usize> for $addr {
            type Output = $addr;

            fn add(self, other: usize) -> Self::Output {
                $addr(self.0 + other)
            }
        }
    };
}

impl_addr_arith!(VirtAddr);
impl_addr_arith!(PhysAddr);

impl fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PHYS_0x{:016x}", self.0)
    }
}

impl fmt::Pointer for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VIRT_0x{:016x}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_number_and_alignment() {
        let addr = PhysAddr(0x8123);
        assert_eq!(addr.page_number(), 8);
        assert_eq!(addr.align_down(PAGE_SIZE), PhysAddr(0x8000));
        assert_eq!(addr.align_up(PAGE_SIZE), PhysAddr(0x9000));
        assert_eq!(addr.identity() + 0x10, VirtAddr(0x8133));
    }
}
