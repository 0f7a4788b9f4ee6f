//! State owned by the BSP while it initializes the system.

use apic::timer::{ApicTimer, CalibrationError, ReferenceTimer, WaitForInterrupt};
use apic::{LocalApic, RegisterAccess};
use bare_metal::cpu::CpuidSource;

use crate::config::{BootConfig, TIMER_VECTOR};
use crate::smp::bringup::{Bringup, BringupCounter, BringupError, BringupReport, Launchpad};
use crate::smp::topology::TopologyWidths;
use crate::smp::{self, CpuTable, FirmwareTopology};

/// Everything the boot sequence builds up, passed to the parts that need it.
///
/// The CPU table is complete before the first AP starts and never changes afterwards,
/// the APs only ever touch the bring-up counter.
pub struct InitContext<R> {
    pub config: BootConfig,
    pub apic: LocalApic<R>,
    pub cpus: CpuTable,
    pub timer: Option<ApicTimer>,
    pub counter: BringupCounter,
}

impl<R: RegisterAccess> InitContext<R> {
    /// `apic` must already be enabled.
    pub fn new(config: BootConfig, apic: LocalApic<R>) -> InitContext<R> {
        InitContext {
            config,
            apic,
            cpus: CpuTable::new(),
            timer: None,
            counter: BringupCounter::new(),
        }
    }

    /// Fill the CPU table from the processor topology and the firmware tables.
    pub fn discover_cpus<C: CpuidSource, F: FirmwareTopology>(&mut self, cpuid: &C, firmware: &F) -> &CpuTable {
        let widths = TopologyWidths::decode(cpuid);
        let capacity = if self.config.smp { self.config.max_cpus } else { 1 };
        self.cpus = smp::discover_cpus(firmware, widths, self.apic.id(), capacity);
        info!("found {} CPUs", self.cpus.len());
        &self.cpus
    }

    /// Measure the APIC timer frequency. Without a calibrated timer, no APs can be started.
    pub fn calibrate_timer<T: ReferenceTimer>(&mut self, reference: &mut T) -> Result<ApicTimer, CalibrationError> {
        let calibration = self.apic.calibrate_timer(reference, TIMER_VECTOR)?;
        let timer = ApicTimer::new(calibration, TIMER_VECTOR);
        self.timer = Some(timer);
        Ok(timer)
    }

    /// Start the APs in the CPU table.
    pub fn start_aps<W: WaitForInterrupt, L: Launchpad>(&self, waiter: &mut W, launchpad: &mut L) -> Result<BringupReport, BringupError> {
        let timer = self.timer.ok_or(BringupError::NotCalibrated)?;
        Ok(Bringup::new(&self.apic, timer, waiter, launchpad, &self.counter).start_all(&self.cpus))
    }
}
