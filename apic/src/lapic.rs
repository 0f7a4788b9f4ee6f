use core::hint;

use bare_metal::paging::{MapError, PageFlags, PageMapper};
use bare_metal::{Bits, PhysAddr};

use super::ipi::InterruptCommand;
use super::{ApicId, Register, RegisterAccess};

/// Set in the base MSR when the current processor is the bootstrap processor.
const BASE_MSR_BSP_BIT: u32 = 8;
/// Globally enables the local APIC.
const BASE_MSR_ENABLE_BIT: u32 = 11;
/// Software enable flag in the spurious interrupt vector register.
const SPURIOUS_ENABLE_BIT: u32 = 8;

/// How often to poll the delivery status of a sent IPI before giving up on it.
const ICR_DELIVERY_SPINS: usize = 100_000;

/// The local APIC of the processor executing the code.
pub struct LocalApic<R> {
    regs: R,
}

impl<R: RegisterAccess> LocalApic<R> {
    pub fn new(regs: R) -> LocalApic<R> {
        LocalApic { regs }
    }

    /// Direct access to the registers, for the parts of the APIC without a typed wrapper.
    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// The id of the current processor's APIC.
    pub fn id(&self) -> ApicId {
        ApicId(self.regs.read_reg(Register::ID).get_bits(24..=31) as u8)
    }

    /// Whether the current processor is the bootstrap processor.
    pub fn is_bootstrap(&self) -> bool {
        self.regs.read_base_msr().get_bit(BASE_MSR_BSP_BIT)
    }

    /// Return the physical base address of the memory mapped APIC registers.
    pub fn base_address(&self) -> PhysAddr {
        PhysAddr(self.regs.read_base_msr().get_bits(12..=35) as usize * 4096)
    }

    /// Enable the local APIC with its registers at `base`, identity mapped through `mapper`,
    /// and start accepting interrupts with spurious interrupts delivered to `spurious_vector`.
    ///
    /// No register is accessed before the mapping exists.
    pub fn enable<M: PageMapper>(&self, base: PhysAddr, mapper: &mut M, spurious_vector: u8) -> Result<(), MapError> {
        let mut msr = self.regs.read_base_msr();
        msr.set_bits(12..=35, (base.0 >> 12) as u64);
        msr.set_bit(BASE_MSR_ENABLE_BIT, true);
        self.regs.write_base_msr(msr);

        mapper.map_page(base, base.identity(), PageFlags::MMIO)?;

        self.software_enable(spurious_vector);
        debug!("local APIC {} enabled at {:p}", self.id(), base);
        Ok(())
    }

    /// Software-enable the local APIC. This is all an AP has to do once the BSP has set up the mapping.
    pub fn software_enable(&self, spurious_vector: u8) {
        let mut value = 0_u32;
        value.set_bits(0..=7, u32::from(spurious_vector));
        value.set_bit(SPURIOUS_ENABLE_BIT, true);
        self.regs.write_reg(Register::SPURIOUS_INTERRUPT_VECTOR, value);
    }

    /// Return the current software-enabled state of the APIC.
    pub fn software_enabled(&self) -> bool {
        self.regs.read_reg(Register::SPURIOUS_INTERRUPT_VECTOR).get_bit(SPURIOUS_ENABLE_BIT)
    }

    /// Signal the end of the current interrupt handler by writing to the EOI register.
    pub fn signal_eoi(&self) {
        self.regs.write_reg(Register::EOI, 0);
    }

    /// Send an inter-processor interrupt.
    ///
    /// Waits a bounded number of polls for the APIC to accept the command. A command that is
    /// still pending afterwards is logged and left to the hardware.
    pub fn send_ipi(&self, command: InterruptCommand) {
        self.regs.write_reg(Register::ICR_HIGH, command.high());
        self.regs.write_reg(Register::ICR_LOW, command.low());

        for _ in 0..ICR_DELIVERY_SPINS {
            if !self.regs.read_reg(Register::ICR_LOW).get_bit(InterruptCommand::DELIVERY_PENDING_BIT) {
                return;
            }
            hint::spin_loop();
        }
        warn!("IPI {:?} to {} still pending", command.delivery_mode, command.destination);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::FakeRegisters;
    use bare_metal::VirtAddr;

    #[derive(Default)]
    struct RecordingMapper<'a> {
        mapped: Vec<(PhysAddr, VirtAddr, PageFlags)>,
        registers: Option<&'a FakeRegisters>,
        writes_before_map: usize,
    }

    impl<'a> PageMapper for RecordingMapper<'a> {
        fn map_page(&mut self, phys: PhysAddr, virt: VirtAddr, flags: PageFlags) -> Result<(), MapError> {
            if let Some(regs) = self.registers {
                self.writes_before_map = regs.writes.borrow().len();
            }
            self.mapped.push((phys, virt, flags));
            Ok(())
        }
    }

    #[test]
    fn identity_and_bootstrap_flag() {
        let regs = FakeRegisters::default();
        regs.set(Register::ID, 0x0500_0000);
        regs.msr.set(0xFEE0_0900);
        let apic = LocalApic::new(&regs);
        assert_eq!(apic.id(), ApicId(5));
        assert!(apic.is_bootstrap());
        assert_eq!(apic.base_address(), PhysAddr(0xFEE0_0000));

        regs.msr.set(0xFEE0_0800);
        assert!(!apic.is_bootstrap());
    }

    #[test]
    fn enable_maps_page_before_register_access() {
        let regs = FakeRegisters::default();
        regs.msr.set(1 << 8);
        let apic = LocalApic::new(&regs);
        let mut mapper = RecordingMapper { registers: Some(&regs), ..Default::default() };

        apic.enable(PhysAddr(0xFEE0_0000), &mut mapper, 0xFF).unwrap();

        assert_eq!(mapper.mapped, vec![(PhysAddr(0xFEE0_0000), VirtAddr(0xFEE0_0000), PageFlags::MMIO)]);
        assert_eq!(mapper.writes_before_map, 0);
        assert_eq!(regs.msr.get(), 0xFEE0_0000 | 1 << 11 | 1 << 8, "BSP flag must survive");
        assert_eq!(regs.value(Register::SPURIOUS_INTERRUPT_VECTOR), 0x1FF);
        assert!(apic.software_enabled());
    }

    #[test]
    fn failed_mapping_leaves_registers_alone() {
        struct FullMapper;
        impl PageMapper for FullMapper {
            fn map_page(&mut self, _: PhysAddr, _: VirtAddr, _: PageFlags) -> Result<(), MapError> {
                Err(MapError::OutOfMemory)
            }
        }

        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        assert_eq!(apic.enable(PhysAddr(0xFEE0_0000), &mut FullMapper, 0xFF), Err(MapError::OutOfMemory));
        assert!(regs.writes.borrow().is_empty());
    }

    #[test]
    fn ipi_writes_high_half_first() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        apic.send_ipi(InterruptCommand::init(ApicId(1)));
        assert_eq!(*regs.writes.borrow(), vec![
            (Register::ICR_HIGH, 0x0100_0000),
            (Register::ICR_LOW, 0x0000_4500),
        ]);
    }

    #[test]
    fn ipi_stuck_in_delivery_gives_up() {
        struct Stuck(FakeRegisters);

        impl RegisterAccess for Stuck {
            fn read_reg(&self, reg: Register) -> u32 {
                let value = self.0.read_reg(reg);
                if reg == Register::ICR_LOW { value | 1 << 12 } else { value }
            }

            fn write_reg(&self, reg: Register, value: u32) {
                self.0.write_reg(reg, value)
            }

            fn read_base_msr(&self) -> u64 {
                self.0.read_base_msr()
            }

            fn write_base_msr(&self, value: u64) {
                self.0.write_base_msr(value)
            }
        }

        let apic = LocalApic::new(Stuck(FakeRegisters::default()));
        apic.send_ipi(InterruptCommand::init(ApicId(3)));
        assert_eq!(apic.registers().0.writes.borrow().len(), 2);
    }

    #[test]
    fn eoi() {
        let regs = FakeRegisters::default();
        regs.set(Register::EOI, 0xDEAD);
        LocalApic::new(&regs).signal_eoi();
        assert_eq!(regs.value(Register::EOI), 0);
    }
}
