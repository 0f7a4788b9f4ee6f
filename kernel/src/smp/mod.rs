//! Discovering the processors of the system and starting them.

pub mod bringup;
pub mod topology;

use core::ops;

use acpi::{Madt, Srat};
use apic::ApicId;

use crate::config::MAX_CPU_COUNT;
use self::topology::{Location, TopologyWidths};

/// Stores information about a CPU.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub struct CpuDescriptor {
    pub acpi_id: u8,
    pub apic_id: ApicId,
    pub location: Location,
    /// NUMA proximity domain, 0 if the firmware does not say.
    pub domain: u32,
    pub is_bsp: bool,
}

/// A table of the CPUs in the system, in firmware order, holding at most [`MAX_CPU_COUNT`] entries.
pub struct CpuTable {
    entries: [CpuDescriptor; MAX_CPU_COUNT],
    count: usize,
    capacity: usize,
}

impl CpuTable {
    pub fn new() -> CpuTable {
        CpuTable::with_capacity(MAX_CPU_COUNT)
    }

    /// An empty table accepting `capacity` entries, but never more than [`MAX_CPU_COUNT`].
    pub fn with_capacity(capacity: usize) -> CpuTable {
        CpuTable {
            entries: [CpuDescriptor::default(); MAX_CPU_COUNT],
            count: 0,
            capacity: capacity.min(MAX_CPU_COUNT),
        }
    }

    /// Return the number of entries.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry and return its index, or give the entry back if the table is full.
    pub fn push(&mut self, entry: CpuDescriptor) -> Result<usize, CpuDescriptor> {
        if self.count >= self.capacity {
            return Err(entry);
        }
        let index = self.count;
        self.entries[index] = entry;
        self.count += 1;
        Ok(index)
    }

    /// Overwrite the last entry and return the one it replaced, or `None` if the table is empty.
    pub fn replace_last(&mut self, entry: CpuDescriptor) -> Option<CpuDescriptor> {
        let last = self.entries[0..self.count].last_mut()?;
        Some(core::mem::replace(last, entry))
    }

    pub fn iter(&self) -> impl Iterator<Item=&CpuDescriptor> {
        self.entries[0..self.count].iter()
    }

    pub fn by_apic_id(&self, apic_id: ApicId) -> Option<&CpuDescriptor> {
        self.iter().find(|cpu| cpu.apic_id == apic_id)
    }

    pub fn bsp(&self) -> Option<&CpuDescriptor> {
        self.iter().find(|cpu| cpu.is_bsp)
    }

    pub fn aps(&self) -> impl Iterator<Item=&CpuDescriptor> {
        self.iter().filter(|cpu| !cpu.is_bsp)
    }
}

impl Default for CpuTable {
    fn default() -> CpuTable {
        CpuTable::new()
    }
}

impl ops::Index<usize> for CpuTable {
    type Output = CpuDescriptor;

    fn index(&self, idx: usize) -> &CpuDescriptor {
        assert!(idx < self.count, "index out of range");
        &self.entries[idx]
    }
}

/// A processor as listed by the firmware.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct LocalApicRecord {
    pub acpi_id: u8,
    pub apic_id: ApicId,
    pub enabled: bool,
}

/// NUMA information about a processor as listed by the firmware.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct AffinityRecord {
    pub apic_id: ApicId,
    pub enabled: bool,
    pub domain: u32,
}

/// The firmware's view of the processors.
pub trait FirmwareTopology {
    /// Call `f` for every processor, in table order.
    fn for_each_local_apic(&self, f: &mut dyn FnMut(LocalApicRecord));

    /// The proximity domain of the processor with `apic_id`, if the firmware has one.
    fn proximity_domain(&self, apic_id: ApicId) -> Option<u32>;
}

/// Domain of the first enabled record for `apic_id`.
pub fn first_domain<I: IntoIterator<Item=AffinityRecord>>(records: I, apic_id: ApicId) -> Option<u32> {
    records.into_iter()
        .find(|record| record.enabled && record.apic_id == apic_id)
        .map(|record| record.domain)
}

/// Topology information from the ACPI tables. The SRAT is optional.
pub struct AcpiTopology<'a> {
    pub madt: &'a Madt,
    pub srat: Option<&'a Srat>,
}

impl<'a> FirmwareTopology for AcpiTopology<'a> {
    fn for_each_local_apic(&self, f: &mut dyn FnMut(LocalApicRecord)) {
        for lapic in self.madt.processor_local_apics() {
            f(LocalApicRecord {
                acpi_id: lapic.processor_id(),
                apic_id: ApicId(lapic.apic_id()),
                enabled: lapic.processor_enabled(),
            });
        }
    }

    fn proximity_domain(&self, apic_id: ApicId) -> Option<u32> {
        let records = self.srat?.local_apic_affinities().map(|affinity| AffinityRecord {
            apic_id: ApicId(affinity.apic_id()),
            enabled: affinity.enabled(),
            domain: affinity.proximity_domain(),
        });
        first_domain(records, apic_id)
    }
}

/// Build the CPU table from the enabled processors reported by `firmware`.
///
/// Processors beyond `capacity` are dropped, keeping the first ones in firmware order. The
/// BSP always gets a place: if the table is already full when it shows up, it takes the place
/// of the last AP.
pub fn discover_cpus<F: FirmwareTopology>(firmware: &F, widths: TopologyWidths, bsp: ApicId, capacity: usize) -> CpuTable {
    let mut table = CpuTable::with_capacity(capacity);
    let mut dropped = 0;

    firmware.for_each_local_apic(&mut |record| {
        if !record.enabled {
            return;
        }
        let cpu = CpuDescriptor {
            acpi_id: record.acpi_id,
            apic_id: record.apic_id,
            location: widths.locate(record.apic_id),
            domain: firmware.proximity_domain(record.apic_id).unwrap_or(0),
            is_bsp: record.apic_id == bsp,
        };
        match table.push(cpu) {
            Ok(index) => debug!("CPU {}: APIC {} at {} in domain {}{}", index, cpu.apic_id, cpu.location, cpu.domain,
                                if cpu.is_bsp { " (BSP)" } else { "" }),
            Err(cpu) if cpu.is_bsp => {
                dropped += 1;
                if let Some(ap) = table.replace_last(cpu) {
                    debug!("BSP {} replaces AP {} in the CPU table", cpu.apic_id, ap.apic_id);
                }
            }
            Err(_) => dropped += 1,
        }
    });

    if dropped > 0 {
        warn!("dropped {} processors beyond the limit of {}", dropped, table.capacity());
    }
    if table.bsp().is_none() {
        warn!("bootstrap processor {} is not in the CPU table", bsp);
    }
    table
}
