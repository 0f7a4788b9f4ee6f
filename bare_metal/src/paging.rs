//! The interface to whatever maintains the page tables.
//!
//! Drivers only need to make single pages accessible with specific caching behaviour,
//! so this is all they get to see.

use core::fmt;

use crate::{PhysAddr, VirtAddr};

bitflags! {
    /// Flags of a page table entry, in their hardware bit positions.
    pub struct PageFlags : u64 {
        const PRESENT  = 0b00000001;
        const WRITABLE = 0b00000010;
        const USER     = 0b00000100;
        /// Write-through caching.
        const PWT      = 0b00001000;
        /// Caching disabled.
        const PCD      = 0b00010000;
        /// Memory mapped device registers: writable, uncached.
        const MMIO     = Self::PRESENT.bits | Self::WRITABLE.bits | Self::PWT.bits | Self::PCD.bits;
    }
}

#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum MapError {
    /// There is already a mapping at the given virtual address.
    MappingExists,
    /// There is no memory left for allocating new page tables.
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::MappingExists => write!(f, "virtual address already mapped"),
            MapError::OutOfMemory => write!(f, "out of memory for page tables"),
        }
    }
}

pub trait PageMapper {
    /// Map the 4K page at `virt` to the physical page at `phys`.
    ///
    /// Both addresses are aligned down to a page boundary.
    fn map_page(&mut self, phys: PhysAddr, virt: VirtAddr, flags: PageFlags) -> Result<(), MapError>;
}
