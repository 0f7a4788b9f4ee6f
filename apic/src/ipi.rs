//! Inter-processor interrupts, sent through the interrupt command register (ICR).

use bare_metal::{Bits, PhysAddr, PAGE_SIZE};

use super::ApicId;

/// How the targeted processors should act upon reception of the interrupt.
#[repr(u32)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum DeliveryMode {
    /// Deliver the interrupt vector to the targeted processors.
    Fixed = 0b000,
    /// Deliver to the processor executing at the lowest priority.
    LowestPriority = 0b001,
    /// System Management Interrupt, the vector must be zero.
    Smi = 0b010,
    /// Non-maskable interrupt, the vector is ignored.
    Nmi = 0b100,
    /// Put the targeted processors into their INIT state, the vector must be zero.
    Init = 0b101,
    /// Start a processor waiting in the INIT state at `vector * 4096` in real mode.
    Startup = 0b110,
}

#[repr(u32)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum DestinationMode {
    Physical = 0,
    Logical = 1,
}

#[repr(u32)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum Level {
    Deassert = 0,
    Assert = 1,
}

#[repr(u32)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

#[repr(u32)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum Shorthand {
    /// Only the processor in the destination field.
    None = 0b00,
    ToSelf = 0b01,
    AllIncludingSelf = 0b10,
    AllExcludingSelf = 0b11,
}

/// A complete command for the ICR, split into the two register halves when sent.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct InterruptCommand {
    pub destination: ApicId,
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub destination_mode: DestinationMode,
    pub level: Level,
    pub trigger_mode: TriggerMode,
    pub shorthand: Shorthand,
}

impl InterruptCommand {
    /// Bit of the low half that is set while the command has not been accepted yet.
    pub const DELIVERY_PENDING_BIT: u32 = 12;

    /// Assert INIT on the processor `destination`.
    pub fn init(destination: ApicId) -> InterruptCommand {
        InterruptCommand {
            destination,
            vector: 0,
            delivery_mode: DeliveryMode::Init,
            destination_mode: DestinationMode::Physical,
            level: Level::Assert,
            trigger_mode: TriggerMode::Edge,
            shorthand: Shorthand::None,
        }
    }

    /// Make the processor `destination` start executing the real mode code in the page at `entry`.
    ///
    /// `entry` must be page aligned and below 1 MiB, only its page number is transmitted.
    pub fn startup(destination: ApicId, entry: PhysAddr) -> InterruptCommand {
        debug_assert!(entry.0 % PAGE_SIZE == 0 && entry.0 < 0x10_0000, "invalid startup page {:p}", entry);
        InterruptCommand {
            destination,
            vector: entry.page_number() as u8,
            delivery_mode: DeliveryMode::Startup,
            destination_mode: DestinationMode::Physical,
            level: Level::Assert,
            trigger_mode: TriggerMode::Edge,
            shorthand: Shorthand::None,
        }
    }

    /// The value for the upper ICR register, which must be written first.
    pub fn high(&self) -> u32 {
        let mut value: u32 = 0;
        value.set_bits(24..=31, u32::from(self.destination.0));
        value
    }

    /// The value for the lower ICR register. Writing it sends the interrupt.
    pub fn low(&self) -> u32 {
        let mut value = u32::from(self.vector);
        value.set_bits(8..=10, self.delivery_mode as u32);
        value.set_bit(11, self.destination_mode == DestinationMode::Logical);
        value.set_bit(14, self.level == Level::Assert);
        value.set_bit(15, self.trigger_mode == TriggerMode::Level);
        value.set_bits(18..=19, self.shorthand as u32);
        value
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_command() {
        let cmd = InterruptCommand::init(ApicId(3));
        assert_eq!(cmd.high(), 0x0300_0000);
        assert_eq!(cmd.low(), 0x0000_4500);
    }

    #[test]
    fn startup_command() {
        let cmd = InterruptCommand::startup(ApicId(0x12), PhysAddr(0x8000));
        assert_eq!(cmd.high(), 0x1200_0000);
        assert_eq!(cmd.low(), 0x0000_4608);
    }

    #[test]
    fn shorthand_and_modes() {
        let cmd = InterruptCommand {
            destination: ApicId(0),
            vector: 0x40,
            delivery_mode: DeliveryMode::Fixed,
            destination_mode: DestinationMode::Logical,
            level: Level::Deassert,
            trigger_mode: TriggerMode::Level,
            shorthand: Shorthand::AllExcludingSelf,
        };
        assert_eq!(cmd.low(), 0x000C_8840);
    }
}
