//! Decoding how an APIC id splits into chip, core and thread index.

use core::fmt;

use apic::ApicId;
use bare_metal::cpu::{CpuidResult, CpuidSource};
use bare_metal::{ceil_log2, Bits};

const LEAF_VENDOR: u32 = 0x0;
const LEAF_FEATURES: u32 = 0x1;
const LEAF_CACHE_PARAMETERS: u32 = 0x4;
const LEAF_EXTENDED_TOPOLOGY: u32 = 0xB;
const LEAF_EXTENDED_MAX: u32 = 0x8000_0000;
const LEAF_CORE_COUNT: u32 = 0x8000_0008;

/// Hyper-threading bit in `edx` of the feature leaf, set when the logical processor count is valid.
const FEATURE_HTT_BIT: u32 = 28;

/// Processor vendors with different ways of reporting the topology.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    pub fn from_signature(signature: &[u8; 12]) -> Vendor {
        match signature {
            b"GenuineIntel" => Vendor::Intel,
            b"AuthenticAMD" => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }

    /// The vendor of the processor answering `leaf0`, the result of cpuid leaf 0.
    pub fn from_leaf0(leaf0: &CpuidResult) -> Vendor {
        let mut signature = [0; 12];
        signature[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
        signature[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
        signature[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
        Vendor::from_signature(&signature)
    }
}

/// Number of low APIC id bits taken by the thread and the core index.
/// The chip index is made of the remaining bits.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct TopologyWidths {
    pub thread_bits: u32,
    pub core_bits: u32,
}

/// Position of a logical processor in the topology.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct Location {
    pub chip: u32,
    pub core: u32,
    pub thread: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.chip, self.core, self.thread)
    }
}

impl TopologyWidths {
    /// Every APIC id is a chip of its own.
    pub const FLAT: TopologyWidths = TopologyWidths { thread_bits: 0, core_bits: 0 };

    /// Query the processor for its topology.
    pub fn decode<C: CpuidSource>(cpuid: &C) -> TopologyWidths {
        let leaf0 = cpuid.cpuid(LEAF_VENDOR, 0);
        let max_leaf = leaf0.eax;
        let vendor = Vendor::from_leaf0(&leaf0);

        let features = cpuid.cpuid(LEAF_FEATURES, 0);
        if !features.edx.get_bit(FEATURE_HTT_BIT) {
            debug!("{:?} processor without multithreading", vendor);
            return TopologyWidths::FLAT;
        }
        let chip_threads_max = features.ebx.get_bits(16..=23);

        let widths = match vendor {
            Vendor::Intel => intel_widths(cpuid, max_leaf, chip_threads_max),
            Vendor::Amd => amd_widths(cpuid, chip_threads_max),
            Vendor::Unknown => Some(TopologyWidths::FLAT),
        };
        match widths {
            Some(widths) => {
                debug!("{:?} topology: {} thread bits, {} core bits", vendor, widths.thread_bits, widths.core_bits);
                widths
            }
            None => {
                warn!("inconsistent {:?} topology information, assuming one thread per chip", vendor);
                TopologyWidths::FLAT
            }
        }
    }

    /// Split an APIC id into its parts.
    pub fn locate(&self, apic_id: ApicId) -> Location {
        let id = u64::from(apic_id.0);
        let chip_shift = self.thread_bits + self.core_bits;
        Location {
            chip: (id >> chip_shift) as u32,
            core: ((id >> self.thread_bits) & low_mask(self.core_bits)) as u32,
            thread: (id & low_mask(self.thread_bits)) as u32,
        }
    }
}

fn low_mask(bits: u32) -> u64 {
    (1 << bits) - 1
}

fn intel_widths<C: CpuidSource>(cpuid: &C, max_leaf: u32, chip_threads_max: u32) -> Option<TopologyWidths> {
    if max_leaf >= LEAF_EXTENDED_TOPOLOGY {
        let thread_bits = cpuid.cpuid(LEAF_EXTENDED_TOPOLOGY, 0).eax.get_bits(0..=4);
        let core_level_bits = cpuid.cpuid(LEAF_EXTENDED_TOPOLOGY, 1).eax.get_bits(0..=4);
        let core_bits = core_level_bits.checked_sub(thread_bits)?;
        Some(TopologyWidths { thread_bits, core_bits })
    } else if max_leaf >= LEAF_CACHE_PARAMETERS {
        let core_index_max = cpuid.cpuid(LEAF_CACHE_PARAMETERS, 0).eax.get_bits(26..=31);
        let core_bits = ceil_log2(core_index_max + 1);
        let thread_bits = ceil_log2(chip_threads_max).checked_sub(core_bits)?;
        Some(TopologyWidths { thread_bits, core_bits })
    } else {
        Some(TopologyWidths { thread_bits: ceil_log2(chip_threads_max), core_bits: 0 })
    }
}

fn amd_widths<C: CpuidSource>(cpuid: &C, chip_threads_max: u32) -> Option<TopologyWidths> {
    let max_extended_leaf = cpuid.cpuid(LEAF_EXTENDED_MAX, 0).eax;
    if max_extended_leaf >= LEAF_CORE_COUNT {
        let ecx = cpuid.cpuid(LEAF_CORE_COUNT, 0).ecx;
        let core_bits = match ecx.get_bits(12..=15) {
            0 => ceil_log2(ecx.get_bits(0..=7) + 1),
            bits => bits,
        };
        let thread_bits = ceil_log2(chip_threads_max).checked_sub(core_bits)?;
        Some(TopologyWidths { thread_bits, core_bits })
    } else {
        Some(TopologyWidths { thread_bits: 0, core_bits: ceil_log2(chip_threads_max) })
    }
}
