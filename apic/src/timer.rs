//! The local APIC timer: calibration against a reference clock, and one-shot or periodic
//! interrupts after arbitrary intervals.

use core::fmt;
use core::num::NonZeroU32;
use core::time::Duration;

use bare_metal::{cpu, highest_set_bit, Bits};

use super::{LocalApic, Register, RegisterAccess};

/// Length of the window measured by a [`ReferenceTimer`].
pub const CALIBRATION_WINDOW: Duration = Duration::from_millis(10);

/// Width of the initial count register.
const COUNTER_BITS: u32 = 32;

/// Values of the divide configuration register. Bit 2 is not used, so the encoding is not
/// a plain binary number.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum TimerDivisor {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

impl TimerDivisor {
    /// The divisor `2^shift`, if there is one.
    pub fn from_shift(shift: u32) -> Option<TimerDivisor> {
        match shift {
            0 => Some(TimerDivisor::By1),
            1 => Some(TimerDivisor::By2),
            2 => Some(TimerDivisor::By4),
            3 => Some(TimerDivisor::By8),
            4 => Some(TimerDivisor::By16),
            5 => Some(TimerDivisor::By32),
            6 => Some(TimerDivisor::By64),
            7 => Some(TimerDivisor::By128),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum TimerMode {
    OneShot = 0,
    Periodic = 0b01,
}

/// The local vector table entry of the timer.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct LvtTimerEntry(u32);

impl LvtTimerEntry {
    const MASKED_BIT: u32 = 16;

    pub fn new(vector: u8, mode: TimerMode) -> LvtTimerEntry {
        let mut value = 0_u32;
        value.set_bits(0..=7, u32::from(vector));
        value.set_bits(17..=18, mode as u32);
        LvtTimerEntry(value)
    }

    pub fn one_shot(vector: u8) -> LvtTimerEntry {
        Self::new(vector, TimerMode::OneShot)
    }

    pub fn periodic(vector: u8) -> LvtTimerEntry {
        Self::new(vector, TimerMode::Periodic)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn vector(self) -> u8 {
        self.0.get_bits(0..=7) as u8
    }

    pub fn masked(self) -> bool {
        self.0.get_bit(Self::MASKED_BIT)
    }

    pub fn periodic_mode(self) -> bool {
        self.0.get_bits(17..=18) == TimerMode::Periodic as u32
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum CalibrationError {
    /// The reference timer never signalled the end of its window.
    ReferenceTimeout,
    /// The APIC timer did not count at all during the window.
    NoTicks,
}

impl fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CalibrationError::ReferenceTimeout => write!(f, "reference timer did not fire"),
            CalibrationError::NoTicks => write!(f, "APIC timer did not count"),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TimerError {
    /// The interval does not fit into the counter, even with the largest divisor.
    IntervalOverflow { interval: Duration },
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TimerError::IntervalOverflow { interval } => write!(f, "timer overflow for interval {:?}", interval),
        }
    }
}

/// A clock with a known frequency used to measure the APIC timer frequency.
pub trait ReferenceTimer {
    /// Set up a one-shot window of [`CALIBRATION_WINDOW`] without starting it yet.
    fn prepare(&mut self);

    /// Start counting down the window.
    fn start(&mut self);

    /// Busy wait until the window has elapsed. Returns `false` if it did not elapse in time.
    fn wait(&mut self) -> bool;

    /// Stop the reference timer.
    fn disable(&mut self);
}

/// Blocks the current processor until an interrupt arrives.
pub trait WaitForInterrupt {
    fn wait_for_interrupt(&mut self);
}

/// Waits with the `hlt` instruction. Interrupts are enabled on the way, and stay enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hlt;

impl WaitForInterrupt for Hlt {
    fn wait_for_interrupt(&mut self) {
        unsafe { cpu::enable_interrupts_and_hlt() }
    }
}

/// The measured speed of the APIC timer at divisor 1.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct TimerCalibration {
    ticks_per_10ms: NonZeroU32,
}

/// Divisor and initial count programming a specific interval.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct TimerSetting {
    pub divisor: TimerDivisor,
    pub initial_count: u32,
}

impl TimerCalibration {
    pub fn from_ticks_per_10ms(ticks: u32) -> Option<TimerCalibration> {
        NonZeroU32::new(ticks).map(|ticks_per_10ms| TimerCalibration { ticks_per_10ms })
    }

    pub fn ticks_per_10ms(&self) -> u32 {
        self.ticks_per_10ms.get()
    }

    /// Compute the divisor and initial count for `interval`.
    ///
    /// Intervals longer than the 32 bit counter can hold at divisor 1 use the smallest divisor
    /// that makes them fit. Intervals too short for a single tick still get one.
    pub fn setting_for(&self, interval: Duration) -> Result<TimerSetting, TimerError> {
        let window_us = CALIBRATION_WINDOW.as_micros();
        let raw_ticks = interval.as_micros() * u128::from(self.ticks_per_10ms.get()) / window_us;
        if raw_ticks > u128::from(u64::MAX) {
            return Err(TimerError::IntervalOverflow { interval });
        }
        let raw_ticks = raw_ticks as u64;

        let extra_bits = match highest_set_bit(raw_ticks) {
            Some(bit) if bit >= COUNTER_BITS => bit + 1 - COUNTER_BITS,
            _ => 0,
        };
        let divisor = TimerDivisor::from_shift(extra_bits)
            .ok_or(TimerError::IntervalOverflow { interval })?;
        let initial_count = (raw_ticks >> extra_bits).max(1) as u32;
        Ok(TimerSetting { divisor, initial_count })
    }
}

/// The calibrated APIC timer, delivering its interrupts to a fixed vector.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ApicTimer {
    calibration: TimerCalibration,
    vector: u8,
}

impl ApicTimer {
    pub fn new(calibration: TimerCalibration, vector: u8) -> ApicTimer {
        ApicTimer { calibration, vector }
    }

    pub fn calibration(&self) -> TimerCalibration {
        self.calibration
    }

    /// Start the timer to fire after `interval`, once or repeatedly.
    ///
    /// A running timer is stopped first. If the interval cannot be represented, the error is
    /// logged and returned, and no timer is left running. An idle timer is not touched at all then.
    pub fn start<R: RegisterAccess>(&self, apic: &LocalApic<R>, interval: Duration, mode: TimerMode) -> Result<(), TimerError> {
        let setting = self.calibration.setting_for(interval).map_err(|err| {
            error!("{}", err);
            if apic.timer_running() {
                apic.stop_timer();
            }
            err
        })?;

        apic.stop_timer();
        let regs = apic.registers();
        regs.write_reg(Register::TIMER_DIVIDE_CONFIG, setting.divisor as u32);
        regs.write_reg(Register::LVT_TIMER, LvtTimerEntry::new(self.vector, mode).raw());
        // arms the countdown, so it comes last
        regs.write_reg(Register::TIMER_INITIAL_COUNT, setting.initial_count);
        Ok(())
    }

    /// Arm a one-shot timer and halt until an interrupt wakes us up.
    ///
    /// Any interrupt ends the wait, not just the timer.
    pub fn sleep<R: RegisterAccess, W: WaitForInterrupt>(
        &self, apic: &LocalApic<R>, waiter: &mut W, interval: Duration
    ) -> Result<(), TimerError> {
        self.start(apic, interval, TimerMode::OneShot)?;
        waiter.wait_for_interrupt();
        Ok(())
    }
}

impl<R: RegisterAccess> LocalApic<R> {
    /// Whether the timer is still counting down.
    pub fn timer_running(&self) -> bool {
        self.registers().read_reg(Register::TIMER_CURRENT_COUNT) != 0
    }

    /// Stop the APIC timer. Stopping a stopped timer does nothing.
    pub fn stop_timer(&self) {
        self.registers().write_reg(Register::TIMER_INITIAL_COUNT, 0);
    }

    /// Measure how fast the APIC timer counts at divisor 1 during one window of `reference`.
    ///
    /// While calibrating, the timer is programmed with `placeholder_vector`, but it is stopped
    /// again before it could ever fire.
    pub fn calibrate_timer<T: ReferenceTimer>(&self, reference: &mut T, placeholder_vector: u8) -> Result<TimerCalibration, CalibrationError> {
        let regs = self.registers();
        regs.write_reg(Register::LVT_TIMER, LvtTimerEntry::one_shot(placeholder_vector).raw());
        regs.write_reg(Register::TIMER_DIVIDE_CONFIG, TimerDivisor::By1 as u32);

        reference.prepare();
        regs.write_reg(Register::TIMER_INITIAL_COUNT, u32::MAX);
        reference.start();
        let elapsed = reference.wait();
        let current = regs.read_reg(Register::TIMER_CURRENT_COUNT);

        self.stop_timer();
        reference.disable();

        if !elapsed {
            error!("timer calibration failed: {}", CalibrationError::ReferenceTimeout);
            return Err(CalibrationError::ReferenceTimeout);
        }
        match TimerCalibration::from_ticks_per_10ms(u32::MAX - current) {
            Some(calibration) => {
                info!("APIC timer: {} ticks per 10ms", calibration.ticks_per_10ms());
                Ok(calibration)
            }
            None => {
                error!("timer calibration failed: {}", CalibrationError::NoTicks);
                Err(CalibrationError::NoTicks)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::FakeRegisters;

    mod counting_log {
        use std::cell::Cell;
        use std::sync::Once;

        use log::{Level, LevelFilter, Log, Metadata, Record};

        thread_local!(static ERRORS: Cell<usize> = Cell::new(0));

        struct CountingLogger;

        impl Log for CountingLogger {
            fn enabled(&self, _metadata: &Metadata) -> bool {
                true
            }

            fn log(&self, record: &Record) {
                if record.level() == Level::Error {
                    ERRORS.with(|e| e.set(e.get() + 1));
                }
            }

            fn flush(&self) {}
        }

        static LOGGER: CountingLogger = CountingLogger;
        static INIT: Once = Once::new();

        /// Run `f` and return how many errors it logged on this thread.
        pub fn errors_logged<F: FnOnce()>(f: F) -> usize {
            INIT.call_once(|| {
                log::set_logger(&LOGGER).unwrap();
                log::set_max_level(LevelFilter::Trace);
            });
            let before = ERRORS.with(|e| e.get());
            f();
            ERRORS.with(|e| e.get()) - before
        }
    }

    use self::counting_log::errors_logged;

    const TIMER_VECTOR: u8 = 0x20;

    fn timer(ticks_per_10ms: u32) -> ApicTimer {
        ApicTimer::new(TimerCalibration::from_ticks_per_10ms(ticks_per_10ms).unwrap(), TIMER_VECTOR)
    }

    fn setting(ticks_per_10ms: u32, interval: Duration) -> Result<TimerSetting, TimerError> {
        timer(ticks_per_10ms).calibration().setting_for(interval)
    }

    #[test]
    fn divisor_encoding() {
        let encodings: Vec<u32> = (0..8).map(|s| TimerDivisor::from_shift(s).unwrap() as u32).collect();
        assert_eq!(encodings, vec![0b1011, 0b0000, 0b0001, 0b0010, 0b0011, 0b1000, 0b1001, 0b1010]);
        assert_eq!(TimerDivisor::from_shift(8), None);
    }

    #[test]
    fn lvt_timer_entry() {
        let t = LvtTimerEntry::periodic(33);
        assert_eq!(t.raw(), 0b010_0000_0000_0010_0001);
        assert!(t.periodic_mode());
        assert!(!t.masked());
        assert_eq!(LvtTimerEntry::one_shot(33).raw(), 33);
    }

    #[test]
    fn setting_without_divisor() {
        let s = setting(100_000, Duration::from_millis(100)).unwrap();
        assert_eq!(s, TimerSetting { divisor: TimerDivisor::By1, initial_count: 1_000_000 });
    }

    #[test]
    fn setting_picks_smallest_fitting_divisor() {
        // at 10000 ticks per 10ms, one tick is one microsecond
        let s = setting(10_000, Duration::from_micros(u64::from(u32::MAX))).unwrap();
        assert_eq!(s, TimerSetting { divisor: TimerDivisor::By1, initial_count: u32::MAX });

        let s = setting(10_000, Duration::from_micros(1 << 32)).unwrap();
        assert_eq!(s, TimerSetting { divisor: TimerDivisor::By2, initial_count: 1 << 31 });

        let s = setting(10_000, Duration::from_micros((1 << 36) + 5)).unwrap();
        assert_eq!(s, TimerSetting { divisor: TimerDivisor::By32, initial_count: 1 << 31 });

        let s = setting(10_000, Duration::from_micros((1 << 39) - 1)).unwrap();
        assert_eq!(s, TimerSetting { divisor: TimerDivisor::By128, initial_count: u32::MAX });
    }

    #[test]
    fn setting_overflow() {
        let interval = Duration::from_micros(1 << 39);
        assert_eq!(setting(10_000, interval), Err(TimerError::IntervalOverflow { interval }));
        let huge = Duration::from_secs(u64::MAX);
        assert_eq!(setting(u32::MAX, huge), Err(TimerError::IntervalOverflow { interval: huge }));
    }

    #[test]
    fn setting_never_zero() {
        let s = setting(100_000, Duration::from_secs(0)).unwrap();
        assert_eq!(s, TimerSetting { divisor: TimerDivisor::By1, initial_count: 1 });
        let s = setting(1, Duration::from_nanos(999)).unwrap();
        assert_eq!(s.initial_count, 1);
    }

    #[test]
    fn start_programs_initial_count_last() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        timer(100_000).start(&apic, Duration::from_millis(100), TimerMode::Periodic).unwrap();

        assert_eq!(*regs.writes.borrow(), vec![
            (Register::TIMER_INITIAL_COUNT, 0),
            (Register::TIMER_DIVIDE_CONFIG, 0b1011),
            (Register::LVT_TIMER, 1 << 17 | u32::from(TIMER_VECTOR)),
            (Register::TIMER_INITIAL_COUNT, 1_000_000),
        ]);
    }

    #[test]
    fn start_overflow_touches_nothing_and_logs_once() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        let interval = Duration::from_secs(60_000);

        let mut result = Ok(());
        let errors = errors_logged(|| {
            result = timer(100_000).start(&apic, interval, TimerMode::OneShot);
        });

        assert_eq!(result, Err(TimerError::IntervalOverflow { interval }));
        assert_eq!(errors, 1);
        assert!(regs.writes.borrow().is_empty());
    }

    #[test]
    fn start_overflow_stops_running_timer() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        regs.set(Register::TIMER_CURRENT_COUNT, 4_000);
        assert!(apic.timer_running());

        let result = timer(100_000).start(&apic, Duration::from_secs(60_000), TimerMode::Periodic);

        assert!(result.is_err());
        assert_eq!(*regs.writes.borrow(), vec![(Register::TIMER_INITIAL_COUNT, 0)]);
    }

    #[test]
    fn stop_is_idempotent() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        timer(100_000).start(&apic, Duration::from_millis(20), TimerMode::OneShot).unwrap();

        apic.stop_timer();
        let once = regs.values.borrow().clone();
        apic.stop_timer();
        assert_eq!(*regs.values.borrow(), once);
        assert_eq!(regs.value(Register::TIMER_INITIAL_COUNT), 0);
    }

    struct CountingWait(usize);

    impl WaitForInterrupt for CountingWait {
        fn wait_for_interrupt(&mut self) {
            self.0 += 1;
        }
    }

    #[test]
    fn sleep_halts_once() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        let mut wait = CountingWait(0);
        timer(100_000).sleep(&apic, &mut wait, Duration::from_millis(20)).unwrap();
        assert_eq!(wait.0, 1);
        assert_eq!(regs.value(Register::TIMER_INITIAL_COUNT), 200_000);
        assert!(!LvtTimerEntry(regs.value(Register::LVT_TIMER)).periodic_mode());
    }

    #[test]
    fn sleep_does_not_halt_without_timer() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        let mut wait = CountingWait(0);
        assert!(timer(100_000).sleep(&apic, &mut wait, Duration::from_secs(60_000)).is_err());
        assert_eq!(wait.0, 0);
    }

    struct FakeReference<'a> {
        regs: &'a FakeRegisters,
        ticks: u32,
        fires: bool,
        events: Vec<&'static str>,
    }

    impl<'a> ReferenceTimer for FakeReference<'a> {
        fn prepare(&mut self) {
            self.events.push("prepare");
        }

        fn start(&mut self) {
            assert_eq!(self.regs.value(Register::TIMER_INITIAL_COUNT), u32::MAX);
            self.events.push("start");
        }

        fn wait(&mut self) -> bool {
            self.events.push("wait");
            self.regs.set(Register::TIMER_CURRENT_COUNT, u32::MAX - self.ticks);
            self.fires
        }

        fn disable(&mut self) {
            self.events.push("disable");
        }
    }

    #[test]
    fn calibration_measures_window() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);
        let mut reference = FakeReference { regs: &regs, ticks: 123_456, fires: true, events: vec![] };

        let calibration = apic.calibrate_timer(&mut reference, 0x21).unwrap();

        assert_eq!(calibration.ticks_per_10ms(), 123_456);
        assert_eq!(reference.events, vec!["prepare", "start", "wait", "disable"]);
        assert_eq!(regs.value(Register::TIMER_INITIAL_COUNT), 0, "timer must be stopped");
        assert_eq!(regs.value(Register::TIMER_DIVIDE_CONFIG), TimerDivisor::By1 as u32);
        assert_eq!(LvtTimerEntry(regs.value(Register::LVT_TIMER)).vector(), 0x21);
    }

    #[test]
    fn calibration_failures() {
        let regs = FakeRegisters::default();
        let apic = LocalApic::new(&regs);

        let mut silent = FakeReference { regs: &regs, ticks: 5, fires: false, events: vec![] };
        assert_eq!(apic.calibrate_timer(&mut silent, 0x21), Err(CalibrationError::ReferenceTimeout));
        assert_eq!(silent.events.last(), Some(&"disable"));

        let mut frozen = FakeReference { regs: &regs, ticks: 0, fires: true, events: vec![] };
        assert_eq!(apic.calibrate_timer(&mut frozen, 0x21), Err(CalibrationError::NoTicks));
        assert_eq!(regs.value(Register::TIMER_INITIAL_COUNT), 0);
    }
}
