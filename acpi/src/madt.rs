use bare_metal::PhysAddr;

use super::{AcpiTable, RecordHeader, RecordIter, SdtHeader};

/// The Multiple APIC Description Table.
#[repr(C, packed)]
pub struct Madt {
    header: SdtHeader,
    local_apic_address: u32,
    flags: u32,
}

assert_eq_size!(Madt, [u8; 44]);

impl AcpiTable for Madt {
    const SIGNATURE: &'static [u8; 4] = b"APIC";

    fn header(&self) -> &SdtHeader {
        &self.header
    }
}

impl Madt {
    /// Returns the physical address at which the local APIC is mapped.
    /// If a local APIC address override is specified, that address is returned,
    /// otherwise, the 32 bit address from the header is returned.
    pub fn local_apic_address(&self) -> PhysAddr {
        let default_addr = PhysAddr(self.local_apic_address as usize);
        self.iter()
            .find_map(|r| r.local_apic_address_override())
            .map_or(default_addr, |r| r.local_apic_address())
    }

    /// Iterate over all MADT entries in table order.
    pub fn iter(&self) -> impl Iterator<Item=MadtEntry<'_>> + '_ {
        RecordIter::new(self, core::mem::size_of::<Madt>()).map(MadtEntry::from_header)
    }

    /// Returns an iterator over all local APICs, enabled or not, in table order.
    pub fn processor_local_apics(&self) -> impl Iterator<Item=&ProcessorLocalApic> {
        self.iter().filter_map(|f| f.processor_local_apic())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MadtEntry<'a> {
    ProcessorLocalApic(&'a ProcessorLocalApic),
    LocalApicAddressOverride(&'a LocalApicAddressOverride),
    Other(&'a RecordHeader),
}

impl<'a> MadtEntry<'a> {
    pub fn from_header(header: &'a RecordHeader) -> MadtEntry<'a> {
        unsafe {
            if let Some(lapic) = header.checked_cast::<ProcessorLocalApic>(ProcessorLocalApic::ENTRY_TYPE) {
                MadtEntry::ProcessorLocalApic(lapic)
            } else if let Some(over) = header.checked_cast::<LocalApicAddressOverride>(LocalApicAddressOverride::ENTRY_TYPE) {
                MadtEntry::LocalApicAddressOverride(over)
            } else {
                MadtEntry::Other(header)
            }
        }
    }

    pub fn processor_local_apic(&self) -> Option<&'a ProcessorLocalApic> {
        match self {
            MadtEntry::ProcessorLocalApic(this) => Some(*this),
            _ => None
        }
    }

    pub fn local_apic_address_override(&self) -> Option<&'a LocalApicAddressOverride> {
        match self {
            MadtEntry::LocalApicAddressOverride(this) => Some(*this),
            _ => None
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(C, packed)]
pub struct ProcessorLocalApic {
    record_header: RecordHeader,
    processor_id: u8,
    apic_id: u8,
    /// bit 0 = processor enabled
    flags: u32,
}

assert_eq_size!(ProcessorLocalApic, [u8; 8]);

impl ProcessorLocalApic {
    pub const ENTRY_TYPE: u8 = 0;

    /// Return the ACPI processor ID of the CPU that this APIC belongs to.
    #[inline(always)]
    pub fn processor_id(&self) -> u8 {
        self.processor_id
    }

    /// Return the id of this APIC.
    pub fn apic_id(&self) -> u8 {
        self.apic_id
    }

    /// Check whether the CPU belonging to this APIC is enabled.
    pub fn processor_enabled(&self) -> bool {
        self.flags & 1 != 0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(C, packed)]
pub struct LocalApicAddressOverride {
    record_header: RecordHeader,
    reserved: u16,
    local_apic_address: u64,
}

assert_eq_size!(LocalApicAddressOverride, [u8; 12]);

impl LocalApicAddressOverride {
    pub const ENTRY_TYPE: u8 = 5;

    pub fn local_apic_address(&self) -> PhysAddr {
        PhysAddr(self.local_apic_address as usize)
    }
}
