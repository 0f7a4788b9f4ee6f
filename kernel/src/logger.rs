//! Log output on the first serial port.

use core::fmt::{self, Write};

use bare_metal::cpu::io::com::{SerialPort, COM1_ADDR};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

pub struct SerialLogger {
    port: Mutex<SerialPort>,
}

static LOGGER: SerialLogger = SerialLogger {
    port: Mutex::new(unsafe { SerialPort::new(COM1_ADDR) }),
};

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut port = self.port.lock();
            // nowhere to report a failing serial port
            let _ = write_record(&mut *port, record);
        }
    }

    fn flush(&self) {}
}

/// Format a record as a single line.
pub fn write_record<W: Write>(out: &mut W, record: &Record) -> fmt::Result {
    writeln!(out, "[{:<5} {}] {}", record.level(), record.target(), record.args())
}

const BAUD_RATE: u32 = 115_200;

/// Install the serial logger. Works only once.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.port.lock().init(BAUD_RATE);
    install(&LOGGER, level)
}

/// Make `logger` the global logger. Fails if there already is one, leaving the level alone.
fn install(logger: &'static dyn Log, level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

/// Write a message that must get out even while a log record is being written.
pub fn emergency_write(args: fmt::Arguments) {
    let mut port = unsafe { SerialPort::new(COM1_ADDR) };
    let _ = port.write_fmt(args);
}
