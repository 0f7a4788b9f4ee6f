//! In-memory stand-ins for the hardware and the firmware.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use apic::{ApicId, Register, RegisterAccess};
use bare_metal::cpu::{CpuidResult, CpuidSource};

use crate::smp::{first_domain, AffinityRecord, FirmwareTopology, LocalApicRecord};

/// Local APIC registers in plain memory that remember every write.
#[derive(Default)]
pub struct FakeRegisters {
    pub values: RefCell<HashMap<Register, u32>>,
    pub writes: RefCell<Vec<(Register, u32)>>,
    pub msr: Cell<u64>,
}

impl FakeRegisters {
    pub fn value(&self, reg: Register) -> u32 {
        self.read_reg(reg)
    }

    pub fn set(&self, reg: Register, value: u32) {
        self.values.borrow_mut().insert(reg, value);
    }
}

impl RegisterAccess for FakeRegisters {
    fn read_reg(&self, reg: Register) -> u32 {
        self.values.borrow().get(&reg).copied().unwrap_or(0)
    }

    fn write_reg(&self, reg: Register, value: u32) {
        self.writes.borrow_mut().push((reg, value));
        self.values.borrow_mut().insert(reg, value);
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

/// Answers cpuid queries from a table, all-zero for unknown leaves.
#[derive(Default)]
pub struct FakeCpuid {
    leaves: HashMap<(u32, u32), CpuidResult>,
}

impl FakeCpuid {
    pub fn with_vendor(signature: &[u8; 12], max_leaf: u32) -> FakeCpuid {
        let word = |i: usize| u32::from_le_bytes([signature[i], signature[i + 1], signature[i + 2], signature[i + 3]]);
        let mut cpuid = FakeCpuid::default();
        cpuid.set(0, 0, CpuidResult { eax: max_leaf, ebx: word(0), edx: word(4), ecx: word(8) });
        cpuid
    }

    pub fn set(&mut self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.leaves.insert((leaf, subleaf), result);
    }
}

impl CpuidSource for FakeCpuid {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.leaves.get(&(leaf, subleaf)).copied().unwrap_or_default()
    }
}

#[derive(Default)]
pub struct FakeFirmware {
    pub local_apics: Vec<LocalApicRecord>,
    pub affinities: Vec<AffinityRecord>,
}

impl FirmwareTopology for FakeFirmware {
    fn for_each_local_apic(&self, f: &mut dyn FnMut(LocalApicRecord)) {
        for &record in &self.local_apics {
            f(record);
        }
    }

    fn proximity_domain(&self, apic_id: ApicId) -> Option<u32> {
        first_domain(self.affinities.iter().copied(), apic_id)
    }
}
