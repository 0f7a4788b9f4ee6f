//! Kernel entry point: brings up the local APIC, the APIC timer and the application processors.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod config;
pub mod context;
pub mod logger;
pub mod smp;

#[cfg(test)]
mod test_util;

use core::{slice, str};

use acpi::{Madt, Srat};
use apic::pit::Pit;
use apic::timer::Hlt;
use apic::{LocalApic, MmioRegisters};
use bare_metal::cpu::io::NativePorts;
use bare_metal::cpu::{self, Msr, NativeCpuid};
use bare_metal::paging::{MapError, PageFlags, PageMapper};
use bare_metal::{Bits, PhysAddr, VirtAddr};

use self::config::{BootConfig, SPURIOUS_VECTOR, TRAMPOLINE_PAGE};
use self::context::InitContext;
use self::smp::bringup::{ApStacks, LowMemoryTrampoline};
use self::smp::AcpiTopology;

/// Maps a physical page at a virtual address. Returns 0 on success, or a [`MapError`] code.
pub type MapPageFn = extern "C" fn(phys: usize, virt: usize, flags: u64) -> u32;

/// Arguments passed to the kernel by the loader.
///
/// Addresses are virtual, the loader identity maps everything below 4 GiB except the
/// local APIC page.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BootArgs {
    pub madt: usize,
    /// 0 if there is no SRAT.
    pub srat: usize,
    pub cmdline: *const u8,
    pub cmdline_len: usize,
    pub map_page: MapPageFn,
    /// Real mode code for [`TRAMPOLINE_PAGE`].
    pub trampoline: *const u8,
    pub trampoline_len: usize,
    /// Memory for the AP stacks.
    pub ap_stacks: usize,
    pub ap_stacks_len: usize,
}

/// The page mapper of the loader.
struct LoaderMapper(MapPageFn);

impl PageMapper for LoaderMapper {
    fn map_page(&mut self, phys: PhysAddr, virt: VirtAddr, flags: PageFlags) -> Result<(), MapError> {
        match (self.0)(phys.0, virt.0, flags.bits()) {
            0 => Ok(()),
            1 => Err(MapError::MappingExists),
            _ => Err(MapError::OutOfMemory),
        }
    }
}

/// The local APIC of the calling processor, at the base address it is configured with.
pub fn local_apic() -> LocalApic<MmioRegisters> {
    let base = unsafe { Msr::APIC_BASE.read() }.get_bits(12..=35) << 12;
    LocalApic::new(unsafe { MmioRegisters::new(PhysAddr(base as usize).identity()) })
}

/// Called by the interrupt stub of [`config::TIMER_VECTOR`].
#[no_mangle]
pub extern "C" fn apic_timer_interrupt() {
    local_apic().signal_eoi();
}

/// This is the Rust entry point that is called by the assembly boot code after switching to long mode.
#[no_mangle]
pub extern "C" fn kernel_main(args: &BootArgs) -> ! {
    // logging works with default settings until the command line is known
    if let Err(err) = logger::init(BootConfig::default().log_level) {
        logger::emergency_write(format_args!("cannot install logger: {}\n", err));
    }

    let cmdline = unsafe { slice::from_raw_parts(args.cmdline, args.cmdline_len) };
    let config = match str::from_utf8(cmdline) {
        Ok(cmdline) => BootConfig::from_cmdline(cmdline),
        Err(_) => {
            warn!("command line is not valid UTF-8, using defaults");
            BootConfig::default()
        }
    };
    log::set_max_level(config.log_level);
    debug!("{:?}", config);

    let madt = match unsafe { acpi::table_from_raw::<Madt>(VirtAddr(args.madt)) } {
        Some(madt) => madt,
        None => fatal(format_args!("invalid MADT")),
    };
    let srat = if args.srat == 0 {
        None
    } else {
        unsafe { acpi::table_from_raw::<Srat>(VirtAddr(args.srat)) }
    };

    let base = config::local_apic_base(madt.local_apic_address());
    let apic = LocalApic::new(unsafe { MmioRegisters::new(base.identity()) });
    if let Err(err) = apic.enable(base, &mut LoaderMapper(args.map_page), SPURIOUS_VECTOR) {
        fatal(format_args!("cannot map local APIC: {}", err));
    }

    if !apic.is_bootstrap() {
        warn!("kernel entered on an AP");
    }

    let mut ctx = InitContext::new(config, apic);
    ctx.discover_cpus(&NativeCpuid, &AcpiTopology { madt, srat });

    let mut pit = Pit::new(unsafe { NativePorts::new() });
    if ctx.calibrate_timer(&mut pit).is_err() {
        error!("no APIC timer, running on the BSP only");
    } else if !ctx.config.smp {
        info!("SMP disabled");
    } else {
        let stacks = ApStacks { base: VirtAddr(args.ap_stacks), len: args.ap_stacks_len };
        let code = unsafe { slice::from_raw_parts(args.trampoline, args.trampoline_len) };
        let page = PhysAddr(TRAMPOLINE_PAGE);
        match unsafe { LowMemoryTrampoline::install(page, page.identity(), code, stacks) } {
            Ok(mut trampoline) => {
                if let Err(err) = ctx.start_aps(&mut Hlt, &mut trampoline) {
                    error!("bring-up failed: {}", err);
                }
            }
            Err(err) => error!("cannot install trampoline: {}", err),
        }
    }

    info!("{} CPUs online", ctx.counter.get() + 1);
    unsafe { cpu::hang() }
}

fn fatal(args: core::fmt::Arguments) -> ! {
    error!("{}", args);
    unsafe {
        cpu::disable_interrupts();
        cpu::hang()
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(panic_info: &core::panic::PanicInfo) -> ! {
    logger::emergency_write(format_args!("{}\n", panic_info));
    unsafe {
        cpu::disable_interrupts();
        cpu::hang()
    }
}
