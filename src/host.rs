//! Host controller backend interface.
//!
//! The generic engine drives every controller through this five-operation
//! table: phase-staged initialization, soft reset, command issue, bus-width
//! get/set, and clock-speed get/set. The standard backend in [`crate::sdhci`]
//! implements it against the common register layout; a platform with a
//! different controller supplies its own implementation at creation time
//! and the engine never learns the difference.

use bitflags::bitflags;

use crate::command::SdCommand;
use crate::error::SdError;

bitflags! {
    /// Software capability flags shared by hosts and cards.
    ///
    /// The effective capability set is always the intersection of what the
    /// host supports and what the card advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        /// High-speed transfer timing.
        const HIGH_SPEED = 0x0001;
        /// 52 MHz high-speed transfer (MMC).
        const HIGH_SPEED_52MHZ = 0x0002;
        /// 4-bit data bus.
        const BUS_4BIT = 0x0004;
        /// 8-bit data bus.
        const BUS_8BIT = 0x0008;
        /// The bus runs in SPI mode.
        const SPI = 0x0010;
        /// Block (rather than byte) addressing.
        const HIGH_CAPACITY = 0x0020;
        /// The controller issues stop transmission itself after
        /// multi-block transfers.
        const AUTO_CMD12 = 0x0040;
        /// The controller supports ADMA2 descriptors.
        const ADMA2 = 0x0080;
        /// 136-bit responses arrive shifted left by one byte.
        const RESPONSE_136_SHIFTED = 0x0100;
    }
}

bitflags! {
    /// Card operating voltage windows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Voltages: u32 {
        /// 1.65 - 1.95 V.
        const V165_195 = 0x0000_0080;
        /// 2.0 - 2.1 V.
        const V20_21 = 0x0000_0100;
        /// 2.1 - 2.2 V.
        const V21_22 = 0x0000_0200;
        /// 2.2 - 2.3 V.
        const V22_23 = 0x0000_0400;
        /// 2.3 - 2.4 V.
        const V23_24 = 0x0000_0800;
        /// 2.4 - 2.5 V.
        const V24_25 = 0x0000_1000;
        /// 2.5 - 2.6 V.
        const V25_26 = 0x0000_2000;
        /// 2.6 - 2.7 V.
        const V26_27 = 0x0000_4000;
        /// 2.7 - 2.8 V.
        const V27_28 = 0x0000_8000;
        /// 2.8 - 2.9 V.
        const V28_29 = 0x0001_0000;
        /// 2.9 - 3.0 V.
        const V29_30 = 0x0002_0000;
        /// 3.0 - 3.1 V.
        const V30_31 = 0x0004_0000;
        /// 3.1 - 3.2 V.
        const V31_32 = 0x0008_0000;
        /// 3.2 - 3.3 V.
        const V32_33 = 0x0010_0000;
        /// 3.3 - 3.4 V.
        const V33_34 = 0x0020_0000;
        /// 3.4 - 3.5 V.
        const V34_35 = 0x0040_0000;
        /// 3.5 - 3.6 V.
        const V35_36 = 0x0080_0000;
    }
}

bitflags! {
    /// Soft-reset targets, bitwise combinable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResetFlags: u32 {
        /// Reset the whole controller.
        const ALL = 0x0000_0001;
        /// Reset the command line.
        const COMMAND_LINE = 0x0000_0002;
        /// Reset the data line.
        const DATA_LINE = 0x0000_0004;
    }
}

/// Initialization phases of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    /// Before bus parameters are programmed: gather capabilities, derive
    /// the voltage mask and the fundamental clock.
    GatherCapabilities,
    /// After the bus has been set to 1 bit at 400 kHz: enable power and
    /// program the interrupt masks.
    ApplyPower,
}

/// Host-level bus parameters negotiated between the engine and a backend.
///
/// The engine seeds these from the creation parameters; phase-staged
/// initialization fills in whatever the caller left unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusParameters {
    /// Supported operating voltage windows.
    pub voltages: Voltages,
    /// The base clock the divisor search works from, in Hertz.
    pub fundamental_clock: u32,
    /// Host capability flags.
    pub host_capabilities: Capabilities,
}

/// Operation table every SD/MMC host controller backend implements.
pub trait SdHost {
    /// Perform controller-specific initialization for the given phase.
    fn initialize(&mut self, phase: InitPhase, bus: &mut BusParameters) -> Result<(), SdError>;

    /// Soft reset the controller lines selected by `flags`.
    fn reset(&mut self, flags: ResetFlags) -> Result<(), SdError>;

    /// Issue a command, capturing its response and moving any attached
    /// data buffer.
    fn send_command(&mut self, command: &mut SdCommand<'_>) -> Result<(), SdError>;

    /// Read the currently programmed bus width.
    fn bus_width(&mut self) -> Result<u32, SdError>;

    /// Program the bus width; only 1, 4, and 8 are valid.
    fn set_bus_width(&mut self, width: u32) -> Result<(), SdError>;

    /// Read the currently programmed clock speed.
    ///
    /// The divisor math is not reversible on standard controllers, so the
    /// default is unsupported.
    fn clock_speed(&mut self) -> Result<u32, SdError> {
        Err(SdError::Unsupported)
    }

    /// Program the clock speed in Hertz.
    fn set_clock_speed(&mut self, hertz: u32) -> Result<(), SdError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_capabilities_are_the_intersection() {
        let host = Capabilities::HIGH_SPEED | Capabilities::BUS_4BIT | Capabilities::AUTO_CMD12;
        let card = Capabilities::HIGH_SPEED
            | Capabilities::HIGH_SPEED_52MHZ
            | Capabilities::BUS_4BIT
            | Capabilities::BUS_8BIT;

        let effective = host & card;
        assert_eq!(effective, Capabilities::HIGH_SPEED | Capabilities::BUS_4BIT);
        assert!(host.contains(effective));
        assert!(card.contains(effective));
    }

    #[test]
    fn reset_flags_combine() {
        let flags = ResetFlags::COMMAND_LINE | ResetFlags::DATA_LINE;
        assert!(flags.contains(ResetFlags::COMMAND_LINE));
        assert!(!flags.contains(ResetFlags::ALL));
    }
}
