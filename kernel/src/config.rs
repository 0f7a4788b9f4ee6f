//! Build time constants and the options given on the kernel command line.

use bare_metal::PhysAddr;
use log::LevelFilter;

/// Maximum number of CPUs the kernel manages.
pub const MAX_CPU_COUNT: usize = 32;

/// Physical page holding the AP trampoline. Must be below 1 MiB.
pub const TRAMPOLINE_PAGE: usize = 0x8000;

/// Size of the initial stack of each AP.
pub const AP_STACK_SIZE: usize = 0x1000;

/// Architectural default of the local APIC base address.
pub const LOCAL_APIC_BASE: usize = 0xFEE0_0000;

/// The local APIC address reported by the firmware, or [`LOCAL_APIC_BASE`] if it reports none.
pub fn local_apic_base(reported: PhysAddr) -> PhysAddr {
    if reported.0 == 0 {
        warn!("firmware reports no local APIC address, using {:#x}", LOCAL_APIC_BASE);
        PhysAddr(LOCAL_APIC_BASE)
    } else {
        reported
    }
}

pub const TIMER_VECTOR: u8 = 0x20;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// Options that can be changed at boot time.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BootConfig {
    /// Whether to start the application processors.
    pub smp: bool,
    /// Upper bound for the number of CPUs, never above [`MAX_CPU_COUNT`].
    pub max_cpus: usize,
    pub log_level: LevelFilter,
}

impl Default for BootConfig {
    fn default() -> BootConfig {
        BootConfig {
            smp: true,
            max_cpus: MAX_CPU_COUNT,
            log_level: LevelFilter::Info,
        }
    }
}

impl BootConfig {
    /// Apply the options of `cmdline` to the defaults. Unknown or malformed options are ignored.
    pub fn from_cmdline(cmdline: &str) -> BootConfig {
        let mut config = BootConfig::default();
        for token in CmdLine::parse(cmdline) {
            match token {
                CmdLineToken::Flag("nosmp") => config.smp = false,
                CmdLineToken::KeyValuePair("maxcpus", value) => match value.parse::<usize>() {
                    Ok(count) if count > 0 => config.max_cpus = count.min(MAX_CPU_COUNT),
                    _ => warn!("invalid CPU count {:?}", value),
                },
                CmdLineToken::KeyValuePair("loglevel", value) => match value.parse() {
                    Ok(level) => config.log_level = level,
                    Err(_) => warn!("invalid log level {:?}", value),
                },
                other => warn!("ignoring unknown option {:?}", other),
            }
        }
        config
    }
}

/// Zero-copy command line parser
pub struct CmdLine<'a> {
    raw: &'a str,
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum CmdLineToken<'a> {
    Flag(&'a str),
    KeyValuePair(&'a str, &'a str),
}

impl<'a> CmdLine<'a> {
    pub fn parse(raw: &'a str) -> CmdLine<'a> {
        CmdLine { raw }
    }

    /// Consume the next symbol: either a quoted string, or a run of characters up to the next
    /// whitespace. Unless `in_value` is set, a key also ends at '='.
    fn symbol(&mut self, in_value: bool) -> Option<&'a str> {
        if let Some(quoted) = self.raw.strip_prefix('"') {
            let (symbol, rest) = match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            };
            self.raw = rest;
            return Some(symbol);
        }

        let end = self.raw
            .find(|c: char| c.is_whitespace() || (!in_value && c == '='))
            .unwrap_or(self.raw.len());
        if end == 0 && !in_value {
            return None;
        }
        let (symbol, rest) = self.raw.split_at(end);
        self.raw = rest;
        Some(symbol)
    }
}

impl<'a> Iterator for CmdLine<'a> {
    type Item = CmdLineToken<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw = self.raw.trim_start();
        if self.raw.is_empty() {
            return None;
        }
        let key = self.symbol(false).unwrap_or("");
        match self.raw.strip_prefix('=') {
            Some(rest) => {
                self.raw = rest;
                let value = self.symbol(true).unwrap_or("");
                Some(CmdLineToken::KeyValuePair(key, value))
            }
            None => Some(CmdLineToken::Flag(key)),
        }
    }
}
