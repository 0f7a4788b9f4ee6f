pub mod io;

use core::arch::asm;

/// Pause the CPU until the next interrupt arrives.
#[inline]
pub unsafe fn hlt() {
    asm!("hlt", options(nomem, nostack, preserves_flags));
}

/// Enable interrupts and pause the CPU until the next interrupt arrives.
///
/// `sti` only takes effect after the following instruction, so an interrupt that is
/// already pending cannot slip in between the two instructions and be missed.
#[inline]
pub unsafe fn enable_interrupts_and_hlt() {
    asm!("sti; hlt", options(nomem, nostack));
}

/// Pause the CPU indefintely. Interrupts may still arrive,
/// depending on the interrupt flags of the CPU.
#[inline]
pub unsafe fn hang() -> ! {
    loop {
        hlt();
    }
}

/// Disable interrupts on the current CPU.
#[inline]
pub unsafe fn disable_interrupts() {
    asm!("cli", options(nomem, nostack));
}

/// The four registers returned by the `cpuid` instruction.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Something that answers processor identification queries.
///
/// The real implementation is [`NativeCpuid`], other implementations replay recorded answers.
pub trait CpuidSource {
    /// Execute a query for `leaf`, passing `subleaf` in `ecx`.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// Queries the processor we are currently running on.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeCpuid;

impl CpuidSource for NativeCpuid {
    #[inline]
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        // rbx is reserved by LLVM, so we cannot name it as an asm operand
        #[allow(unused_unsafe)]
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuidResult { eax: r.eax, ebx: r.ebx, ecx: r.ecx, edx: r.edx }
    }
}

/// A model-specific register.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Msr(pub u32);

impl Msr {
    /// Base address and enable bits of the local APIC.
    pub const APIC_BASE: Msr = Msr(0x1B);

    /// Read the value of a model specific register
    #[inline]
    pub unsafe fn read(self) -> u64 {
        let lo: u32;
        let hi: u32;
        asm!("rdmsr", in("ecx") self.0, out("eax") lo, out("edx") hi, options(nomem, nostack, preserves_flags));
        (lo as u64) | ((hi as u64) << 32)
    }

    /// Write the value of a model specific register
    #[inline]
    pub unsafe fn write(self, val: u64) {
        let lo = (val & 0xFFFF_FFFF) as u32;
        let hi = (val >> 32) as u32;
        asm!("wrmsr", in("ecx") self.0, in("eax") lo, in("edx") hi, options(nostack, preserves_flags));
    }
}
