//! Waking up the application processors with the INIT-SIPI-SIPI sequence.
//!
//! The BSP drives every AP through the sequence, one after the other. An AP has started once
//! it has announced itself on the shared [`BringupCounter`], which is the only state the
//! processors write concurrently.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use apic::ipi::InterruptCommand;
use apic::timer::{ApicTimer, TimerError, WaitForInterrupt};
use apic::{LocalApic, RegisterAccess};
use bare_metal::{cpu, PhysAddr, VirtAddr};

use crate::config::{AP_STACK_SIZE, MAX_CPU_COUNT, SPURIOUS_VECTOR};
use super::{CpuDescriptor, CpuTable};

/// Time for an AP to settle after INIT.
pub const AP_CPU_INIT_TIMEOUT: Duration = Duration::from_millis(20);
/// Interval between checks whether an AP has announced itself.
pub const AP_CPU_RETRY_TIMEOUT: Duration = Duration::from_millis(20);
/// Time an AP gets to announce itself after each startup IPI.
pub const AP_CPU_STARTUP_TIMEOUT: Duration = Duration::from_millis(200);
/// Number of startup IPIs sent before giving up.
pub const AP_CPU_STARTUP_ATTEMPTS: usize = 2;

/// Offset of the [`ApBootData`] in the trampoline page.
pub const BOOT_DATA_OFFSET: usize = 0xF00;

/// Number of processors that completed their bring-up.
#[derive(Debug, Default)]
pub struct BringupCounter(AtomicUsize);

impl BringupCounter {
    pub const fn new() -> BringupCounter {
        BringupCounter(AtomicUsize::new(0))
    }

    /// Count the calling processor as started. This must be the last step of its bring-up,
    /// everything it did before is visible to whoever observes the new count.
    pub fn announce(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum BringupError {
    /// The AP did not announce itself after any of the startup IPIs.
    Timeout,
    /// Waiting with the APIC timer was not possible.
    Timer(TimerError),
    /// There is no stack left for the AP.
    NoStack,
    /// The trampoline code does not fit in front of the boot data.
    TrampolineTooLarge { len: usize },
    /// The APIC timer has not been calibrated.
    NotCalibrated,
}

impl fmt::Display for BringupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BringupError::Timeout => write!(f, "no response to startup IPI"),
            BringupError::Timer(err) => write!(f, "{}", err),
            BringupError::NoStack => write!(f, "out of AP stacks"),
            BringupError::TrampolineTooLarge { len } => write!(f, "trampoline of {} bytes too large", len),
            BringupError::NotCalibrated => write!(f, "APIC timer not calibrated"),
        }
    }
}

/// Progress of a single processor through the bring-up sequence.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ApState {
    Idle,
    InitSent,
    InitSettle,
    SipiSent,
    SipiWait,
    Started,
    Failed(BringupError),
    /// The processor running the bring-up.
    Bootstrap,
}

impl ApState {
    pub fn is_final(&self) -> bool {
        match self {
            ApState::Started | ApState::Failed(_) | ApState::Bootstrap => true,
            _ => false,
        }
    }
}

/// Hand-off block read by the trampoline code once the AP is in long mode.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(C)]
pub struct ApBootData {
    pub stack_top: u64,
    /// Address of [`ap_main`].
    pub entry: u64,
    /// Address of the [`BringupCounter`], passed on to `entry`.
    pub counter: u64,
}

assert_eq_size!(ApBootData, [u8; 24]);

/// Prepares the code an AP runs after its startup IPI.
pub trait Launchpad {
    /// Set up the entry for the AP using stack `slot` and return the page it starts in.
    fn prepare(&mut self, slot: usize, counter: &BringupCounter) -> Result<PhysAddr, BringupError>;
}

/// A region of memory cut into stacks of [`AP_STACK_SIZE`] bytes.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ApStacks {
    pub base: VirtAddr,
    pub len: usize,
}

impl ApStacks {
    /// The initial stack pointer of stack `slot`.
    pub fn top(&self, slot: usize) -> Option<VirtAddr> {
        let end = slot.checked_add(1)?.checked_mul(AP_STACK_SIZE)?;
        if end <= self.len {
            Some(self.base + end)
        } else {
            None
        }
    }
}

/// The real mode trampoline in low memory.
pub struct LowMemoryTrampoline {
    phys: PhysAddr,
    virt: VirtAddr,
    stacks: ApStacks,
}

impl LowMemoryTrampoline {
    /// Copy `code` to the start of the page at `phys`, which is mapped at `virt`.
    ///
    /// The page must be writable, below 1 MiB and not used for anything else.
    pub unsafe fn install(phys: PhysAddr, virt: VirtAddr, code: &[u8], stacks: ApStacks) -> Result<LowMemoryTrampoline, BringupError> {
        if code.len() > BOOT_DATA_OFFSET {
            return Err(BringupError::TrampolineTooLarge { len: code.len() });
        }
        ptr::copy_nonoverlapping(code.as_ptr(), virt.as_mut_ptr::<u8>(), code.len());
        debug!("installed {} byte trampoline at {:p}", code.len(), phys);
        Ok(LowMemoryTrampoline { phys, virt, stacks })
    }
}

impl Launchpad for LowMemoryTrampoline {
    fn prepare(&mut self, slot: usize, counter: &BringupCounter) -> Result<PhysAddr, BringupError> {
        let stack_top = self.stacks.top(slot).ok_or(BringupError::NoStack)?;
        let data = ApBootData {
            stack_top: stack_top.0 as u64,
            entry: ap_main as usize as u64,
            counter: counter as *const BringupCounter as u64,
        };
        unsafe { ptr::write_volatile((self.virt + BOOT_DATA_OFFSET).as_mut_ptr::<ApBootData>(), data) };
        Ok(self.phys)
    }
}

/// Final state of every entry in the CPU table after bring-up.
pub struct BringupReport {
    states: [ApState; MAX_CPU_COUNT],
    count: usize,
}

impl BringupReport {
    fn new() -> BringupReport {
        BringupReport { states: [ApState::Idle; MAX_CPU_COUNT], count: 0 }
    }

    fn push(&mut self, state: ApState) {
        self.states[self.count] = state;
        self.count += 1;
    }

    /// The state of the CPU at `index` in the table.
    pub fn state(&self, index: usize) -> Option<ApState> {
        self.states[0..self.count].get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item=ApState> + '_ {
        self.states[0..self.count].iter().copied()
    }

    /// Number of APs that started.
    pub fn started(&self) -> usize {
        self.iter().filter(|state| *state == ApState::Started).count()
    }

    pub fn failed(&self) -> usize {
        self.iter().filter(|state| match state { ApState::Failed(_) => true, _ => false }).count()
    }
}

/// Drives the bring-up sequence from the BSP.
pub struct Bringup<'a, R, W, L> {
    apic: &'a LocalApic<R>,
    timer: ApicTimer,
    waiter: &'a mut W,
    launchpad: &'a mut L,
    counter: &'a BringupCounter,
}

impl<'a, R, W, L> Bringup<'a, R, W, L>
    where R: RegisterAccess, W: WaitForInterrupt, L: Launchpad
{
    pub fn new(apic: &'a LocalApic<R>, timer: ApicTimer, waiter: &'a mut W, launchpad: &'a mut L, counter: &'a BringupCounter) -> Self {
        Bringup { apic, timer, waiter, launchpad, counter }
    }

    /// Start every AP in `cpus`. A processor that does not respond is skipped.
    pub fn start_all(&mut self, cpus: &CpuTable) -> BringupReport {
        let mut report = BringupReport::new();
        let mut slot = 0;
        for cpu in cpus.iter() {
            if cpu.is_bsp {
                report.push(ApState::Bootstrap);
            } else {
                report.push(self.start_ap(cpu, slot));
                slot += 1;
            }
        }
        info!("started {} of {} APs, {} failed", report.started(), slot, report.failed());
        report
    }

    /// Run the bring-up sequence for `cpu`, giving it stack `slot`.
    pub fn start_ap(&mut self, cpu: &CpuDescriptor, slot: usize) -> ApState {
        let entry = match self.launchpad.prepare(slot, self.counter) {
            Ok(entry) => entry,
            Err(err) => {
                error!("cannot start AP {}: {}", cpu.apic_id, err);
                return ApState::Failed(err);
            }
        };

        let mut state = ApState::Idle;
        let mut attempts = 0;
        let mut waited = Duration::from_secs(0);
        // taken once, so an AP that answers late to the first attempt still counts
        let snapshot = self.counter.get();

        while !state.is_final() {
            trace!("AP {}: {:?}", cpu.apic_id, state);
            state = match state {
                ApState::Idle => {
                    self.apic.send_ipi(InterruptCommand::init(cpu.apic_id));
                    ApState::InitSent
                }
                ApState::InitSent => match self.pause(AP_CPU_INIT_TIMEOUT) {
                    Ok(()) => ApState::InitSettle,
                    Err(err) => ApState::Failed(err),
                },
                ApState::InitSettle => {
                    self.apic.send_ipi(InterruptCommand::startup(cpu.apic_id, entry));
                    attempts += 1;
                    waited = Duration::from_secs(0);
                    ApState::SipiSent
                }
                ApState::SipiSent => self.wait_slice(&mut waited),
                ApState::SipiWait => {
                    if self.counter.get() > snapshot {
                        ApState::Started
                    } else if waited < AP_CPU_STARTUP_TIMEOUT {
                        self.wait_slice(&mut waited)
                    } else if attempts < AP_CPU_STARTUP_ATTEMPTS {
                        debug!("AP {} did not respond, retrying", cpu.apic_id);
                        ApState::InitSettle
                    } else {
                        ApState::Failed(BringupError::Timeout)
                    }
                }
                done => done,
            };
        }

        match state {
            ApState::Started => info!("AP {} started", cpu.apic_id),
            ApState::Failed(err) => error!("AP {} failed to start: {}", cpu.apic_id, err),
            _ => {}
        }
        state
    }

    /// Wait for one retry interval and account for it in `waited`.
    fn wait_slice(&mut self, waited: &mut Duration) -> ApState {
        match self.pause(AP_CPU_RETRY_TIMEOUT) {
            Ok(()) => {
                *waited += AP_CPU_RETRY_TIMEOUT;
                ApState::SipiWait
            }
            Err(err) => ApState::Failed(err),
        }
    }

    fn pause(&mut self, interval: Duration) -> Result<(), BringupError> {
        self.timer.sleep(self.apic, &mut *self.waiter, interval).map_err(BringupError::Timer)
    }
}

/// Entry point of an AP once the trampoline has switched to long mode and loaded the stack
/// from its [`ApBootData`].
#[no_mangle]
pub extern "C" fn ap_main(counter: &'static BringupCounter) -> ! {
    ap_setup(&crate::local_apic(), counter);
    unsafe { cpu::hang() }
}

/// Set up the calling AP and announce it.
pub fn ap_setup<R: RegisterAccess>(apic: &LocalApic<R>, counter: &BringupCounter) {
    apic.software_enable(SPURIOUS_VECTOR);
    counter.announce();
}
