//! Channel 2 of the legacy programmable interval timer, used as the reference clock for
//! calibrating the APIC timer.

use bare_metal::cpu::io::{PortAccess, PortNumber};
use bare_metal::Bits;

use super::timer::ReferenceTimer;

const CHANNEL2_DATA: PortNumber = PortNumber(0x42);
const MODE_COMMAND: PortNumber = PortNumber(0x43);
/// Speaker and channel 2 gate control.
const CONTROL: PortNumber = PortNumber(0x61);

/// Bits of the control port that must be preserved.
const CONTROL_PRESERVE_MASK: u8 = 0x0C;
const CONTROL_GATE_BIT: u32 = 0;
/// Reads as set once channel 2 has counted down to zero.
const CONTROL_OUTPUT_BIT: u32 = 5;

/// Channel 2, lobyte/hibyte access, mode 0 (interrupt on terminal count).
const CHANNEL2_ONE_SHOT: u8 = 0xB0;

/// Count for 10ms at 1.193182 MHz.
const WINDOW_COUNT: u16 = 11932;

/// Upper bound of status polls while waiting for the window to end.
const MAX_POLLS: usize = 10_000_000;

/// The PIT as a [`ReferenceTimer`] with a window of 10ms.
pub struct Pit<P> {
    ports: P,
}

impl<P: PortAccess> Pit<P> {
    pub fn new(ports: P) -> Pit<P> {
        Pit { ports }
    }

    fn control(&mut self) -> u8 {
        self.ports.read_u8(CONTROL) & CONTROL_PRESERVE_MASK
    }
}

impl<P: PortAccess> ReferenceTimer for Pit<P> {
    fn prepare(&mut self) {
        let mut control = self.control();
        control.set_bit(CONTROL_GATE_BIT, true);
        self.ports.write_u8(CONTROL, control);
        self.ports.write_u8(MODE_COMMAND, CHANNEL2_ONE_SHOT);
    }

    fn start(&mut self) {
        // the count runs once the high byte has been written
        let [low, high] = WINDOW_COUNT.to_le_bytes();
        self.ports.write_u8(CHANNEL2_DATA, low);
        self.ports.write_u8(CHANNEL2_DATA, high);
    }

    fn wait(&mut self) -> bool {
        for _ in 0..MAX_POLLS {
            if self.ports.read_u8(CONTROL).get_bit(CONTROL_OUTPUT_BIT) {
                return true;
            }
        }
        false
    }

    fn disable(&mut self) {
        let control = self.control();
        self.ports.write_u8(CONTROL, control);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct FakePorts {
        control: u8,
        polls_until_done: usize,
        polls: usize,
        writes: Vec<(u16, u8)>,
    }

    impl PortAccess for FakePorts {
        fn read_u8(&mut self, port: PortNumber) -> u8 {
            assert_eq!(port, CONTROL);
            self.polls += 1;
            if self.polls > self.polls_until_done {
                self.control | 0x20
            } else {
                self.control
            }
        }

        fn write_u8(&mut self, port: PortNumber, data: u8) {
            if port == CONTROL {
                self.control = data;
            }
            self.writes.push((port.0, data));
        }
    }

    #[test]
    fn programs_ten_millisecond_window() {
        let mut pit = Pit::new(FakePorts { control: 0xFF, polls_until_done: usize::MAX, ..FakePorts::default() });
        pit.prepare();
        pit.start();
        assert_eq!(pit.ports.writes, vec![(0x61, 0x0D), (0x43, 0xB0), (0x42, 0x9C), (0x42, 0x2E)]);
    }

    #[test]
    fn wait_until_output_set() {
        let mut pit = Pit::new(FakePorts { polls_until_done: 3, ..FakePorts::default() });
        assert!(pit.wait());
        assert_eq!(pit.ports.polls, 4);
        pit.disable();
        assert_eq!(pit.ports.writes.last(), Some(&(0x61, 0x00)));
    }

    #[test]
    fn wait_gives_up() {
        let mut pit = Pit::new(FakePorts { polls_until_done: usize::MAX, ..FakePorts::default() });
        assert!(!pit.wait());
        assert_eq!(pit.ports.polls, MAX_POLLS);
    }
}
