//! Read-only access to the ACPI tables describing the processors of the system.
//!
//! Locating the tables is the boot loader's job, this crate only validates and walks them.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate static_assertions;

pub mod util;
mod madt;
mod srat;

pub use self::madt::*;
pub use self::srat::*;

use core::marker::PhantomData;
use core::mem;

use bare_metal::VirtAddr;

pub trait AcpiTable {
    const SIGNATURE: &'static [u8; 4];

    fn header(&self) -> &SdtHeader;

    fn length(&self) -> usize {
        self.header().length()
    }

    fn is_valid(&self) -> bool {
        self.header().signature() == Self::SIGNATURE
            && unsafe { util::acpi_table_checksum(self) == 0 }
    }
}

/// Header of an ACPI system description table.
#[repr(C, packed)]
pub struct SdtHeader {
    signature: [u8; 4],
    length: u32,
    revision: u8,
    checksum: u8,
    oem_id: [u8; 6],
    oem_table_id: [u8; 8],
    oem_revision: u32,
    creator_id: u32,
    creator_revision: u32,
}

assert_eq_size!(SdtHeader, [u8; 36]);

impl SdtHeader {
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn length(&self) -> usize {
        self.length as usize
    }
}

/// Acquire a reference to an ACPI table from a raw virtual address.
/// This function ensures that the memory area pointed to contains a valid ACPI table of the requested type.
pub unsafe fn table_from_raw<T: AcpiTable>(table_addr: VirtAddr) -> Option<&'static T> {
    let table: *const T = table_addr.as_ptr();
    if (*table).is_valid() {
        Some(&*table)
    } else {
        None
    }
}

/// Common header of the variable length records following the fixed part of MADT and SRAT.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(C, packed)]
pub struct RecordHeader {
    record_type: u8,
    record_length: u8,
}

impl RecordHeader {
    /// Reinterpret the record as `T` if it has the expected type and is large enough to hold a `T`.
    ///
    /// The caller must make sure that `expected_type` identifies records of type `T`.
    pub unsafe fn checked_cast<T>(&self, expected_type: u8) -> Option<&T> {
        if self.record_type == expected_type && self.record_length as usize >= mem::size_of::<T>() {
            Some(self.cast())
        } else {
            None
        }
    }

    /// Reinterpret the record as the concrete structure `T`.
    ///
    /// The caller must make sure that the record type corresponds to `T`.
    pub unsafe fn cast<T>(&self) -> &T {
        &*(self as *const RecordHeader as *const T)
    }
}

/// Walks a sequence of [`RecordHeader`]s until the end of the enclosing table.
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    current: *const u8,
    end: *const u8,
    _table: PhantomData<&'a [u8]>,
}

impl<'a> RecordIter<'a> {
    /// Iterate over the records starting `offset` bytes into `table`.
    pub(crate) fn new<T: AcpiTable>(table: &'a T, offset: usize) -> RecordIter<'a> {
        let start = table as *const T as *const u8;
        unsafe {
            RecordIter {
                current: start.add(offset),
                end: start.add(table.length()),
                _table: PhantomData,
            }
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a RecordHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }
        let remaining = self.end as usize - self.current as usize;
        let header = if remaining >= 2 {
            unsafe { &*(self.current as *const RecordHeader) }
        } else {
            self.current = self.end;
            return None;
        };
        let length = header.record_length as usize;
        if length < 2 || length > remaining {
            // a malformed record would make us walk off the table
            self.current = self.end;
            return None;
        }
        self.current = unsafe { self.current.add(length) };
        Some(header)
    }
}

impl<'a> core::iter::FusedIterator for RecordIter<'a> {}
