//! Output on the 16550 compatible serial ports.

use core::fmt;
use core::hint;

use super::PortNumber;

/// The usual address of the COM1 port.
pub const COM1_ADDR: PortNumber = PortNumber(0x3F8);

/// Input clock of the UART divided by 16.
const MAX_BAUD_RATE: u32 = 115_200;

const DATA: u16 = 0;
const INTERRUPT_ENABLE: u16 = 1;
const FIFO_CONTROL: u16 = 2;
const LINE_CONTROL: u16 = 3;
const MODEM_CONTROL: u16 = 4;
const LINE_STATUS: u16 = 5;

/// Line control: divisor latch access.
const DLAB: u8 = 0x80;
/// Line control: 8 data bits, no parity, one stop bit.
const EIGHT_N_ONE: u8 = 0x03;
/// Line status: the transmit holding register can take another byte.
const TRANSMIT_EMPTY: u8 = 0x20;

/// A serial port identified by its base port number.
#[derive(Debug, Eq, PartialEq)]
pub struct SerialPort(PortNumber);

impl SerialPort {
    /// The caller must make sure that the port is really a serial port and
    /// that there is only one handle to it.
    pub const unsafe fn new(base: PortNumber) -> SerialPort {
        SerialPort(base)
    }

    /// Program the port for 8N1 output at `baud` without interrupts.
    pub fn init(&mut self, baud: u32) {
        let divisor = (MAX_BAUD_RATE / baud.max(1)).max(1) as u16;
        let [low, high] = divisor.to_le_bytes();
        unsafe {
            super::outb(self.0 + INTERRUPT_ENABLE, 0);
            super::outb(self.0 + LINE_CONTROL, DLAB);
            super::outb(self.0 + DATA, low);
            super::outb(self.0 + INTERRUPT_ENABLE, high);
            super::outb(self.0 + LINE_CONTROL, EIGHT_N_ONE);
            // enable and clear FIFOs, 14 byte threshold
            super::outb(self.0 + FIFO_CONTROL, 0xC7);
            // DTR and RTS
            super::outb(self.0 + MODEM_CONTROL, 0x03);
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        for &byte in data {
            while unsafe { super::inb(self.0 + LINE_STATUS) } & TRANSMIT_EMPTY == 0 {
                hint::spin_loop();
            }
            unsafe { super::outb(self.0 + DATA, byte) };
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes());
        Ok(())
    }
}
