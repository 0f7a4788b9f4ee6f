use super::{AcpiTable, RecordIter, SdtHeader};

/// The System Resource Affinity Table, associating processors and memory with proximity domains.
#[repr(C, packed)]
pub struct Srat {
    header: SdtHeader,
    reserved1: u32,
    reserved2: u64,
}

assert_eq_size!(Srat, [u8; 48]);

impl AcpiTable for Srat {
    const SIGNATURE: &'static [u8; 4] = b"SRAT";

    fn header(&self) -> &SdtHeader {
        &self.header
    }
}

impl Srat {
    /// Returns an iterator over the processor affinity entries in table order.
    pub fn local_apic_affinities(&self) -> impl Iterator<Item=&LocalApicAffinity> {
        RecordIter::new(self, core::mem::size_of::<Srat>())
            .filter_map(|r| unsafe { r.checked_cast::<LocalApicAffinity>(LocalApicAffinity::ENTRY_TYPE) })
    }
}

/// Processor Local APIC/SAPIC Affinity Structure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(C, packed)]
pub struct LocalApicAffinity {
    record_header: super::RecordHeader,
    proximity_domain_low: u8,
    apic_id: u8,
    /// bit 0 = entry enabled
    flags: u32,
    local_sapic_eid: u8,
    proximity_domain_high: [u8; 3],
    clock_domain: u32,
}

assert_eq_size!(LocalApicAffinity, [u8; 16]);

impl LocalApicAffinity {
    pub const ENTRY_TYPE: u8 = 0;

    pub fn apic_id(&self) -> u8 {
        self.apic_id
    }

    /// Disabled entries must be ignored by the OS.
    pub fn enabled(&self) -> bool {
        self.flags & 1 != 0
    }

    /// The 32 bit proximity domain, assembled from the low byte and the three high bytes.
    pub fn proximity_domain(&self) -> u32 {
        let high = self.proximity_domain_high;
        u32::from(self.proximity_domain_low)
            | u32::from(high[0]) << 8
            | u32::from(high[1]) << 16
            | u32::from(high[2]) << 24
    }
}
