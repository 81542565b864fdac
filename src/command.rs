//! SD/MMC command descriptors.
//!
//! A command is built on the stack per call, handed to the backend's
//! send-command operation, and never retained. The response words and any
//! attached data buffer are filled in by the backend.

use bitflags::bitflags;

/// SD/MMC command opcodes used by the engine.
///
/// A few opcode values are shared between commands: 6 is SWITCH and, after
/// CMD55, the SD set-bus-width application command; 8 is the SD interface
/// condition probe and the MMC extended CSD read. Rust enums cannot repeat
/// discriminants, so each value has one variant used contextually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdOpcode {
    /// CMD0: reset all cards to the idle state.
    GoIdleState = 0,
    /// CMD1: MMC operating condition negotiation.
    SendMmcOperatingCondition = 1,
    /// CMD2: ask all cards to send their identification.
    AllSendCardIdentification = 2,
    /// CMD3: assign (MMC) or request (SD) the relative card address.
    SetRelativeAddress = 3,
    /// CMD6: switch card function; doubles as ACMD6 (set bus width).
    Switch = 6,
    /// CMD7: select the card, moving it to the transfer state.
    SelectCard = 7,
    /// CMD8: SD interface condition probe; doubles as the MMC extended
    /// CSD read.
    SendInterfaceCondition = 8,
    /// CMD9: ask the card for its card-specific data.
    SendCardSpecificData = 9,
    /// CMD10: ask the addressed card for its identification (SPI mode).
    SendCardIdentification = 10,
    /// CMD12: stop an open-ended transfer.
    StopTransmission = 12,
    /// CMD13: ask the card for its status register.
    SendStatus = 13,
    /// CMD16: program the block length.
    SetBlockLength = 16,
    /// CMD17: read one block.
    ReadSingleBlock = 17,
    /// CMD18: read blocks until stop transmission.
    ReadMultipleBlocks = 18,
    /// CMD24: write one block.
    WriteSingleBlock = 24,
    /// CMD25: write blocks until stop transmission.
    WriteMultipleBlocks = 25,
    /// CMD35: set the first erase group.
    EraseGroupStart = 35,
    /// CMD36: set the last erase group.
    EraseGroupEnd = 36,
    /// CMD38: erase the selected groups.
    Erase = 38,
    /// ACMD41: SD operating condition negotiation.
    SendSdOperatingCondition = 41,
    /// ACMD51: read the SD configuration register.
    SendSdConfigurationRegister = 51,
    /// CMD55: the next command is application specific.
    ApplicationSpecific = 55,
    /// CMD58: read the operating condition register (SPI mode).
    SpiReadOperatingCondition = 58,
    /// CMD59: enable or disable CRC checking (SPI mode).
    SpiCrcOnOff = 59,
}

bitflags! {
    /// Response class flags for a command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResponseType: u32 {
        /// A response is expected at all.
        const PRESENT = 1 << 0;
        /// The response is 136 bits instead of 48.
        const LENGTH_136 = 1 << 1;
        /// The response carries a valid CRC to check.
        const VALID_CRC = 1 << 2;
        /// The card signals busy on the data line after the response.
        const BUSY = 1 << 3;
        /// The response echoes the command opcode to check.
        const OPCODE = 1 << 4;
    }
}

impl ResponseType {
    /// No response.
    pub const NONE: ResponseType = ResponseType::empty();
    /// R1: normal response.
    pub const R1: ResponseType = ResponseType::PRESENT
        .union(ResponseType::VALID_CRC)
        .union(ResponseType::OPCODE);
    /// R1b: normal response with a busy phase.
    pub const R1B: ResponseType = ResponseType::R1.union(ResponseType::BUSY);
    /// R2: 136-bit CID/CSD response.
    pub const R2: ResponseType = ResponseType::PRESENT
        .union(ResponseType::VALID_CRC)
        .union(ResponseType::LENGTH_136);
    /// R3: OCR response (no CRC).
    pub const R3: ResponseType = ResponseType::PRESENT;
    /// R6: published relative address.
    pub const R6: ResponseType = ResponseType::R1;
    /// R7: interface condition echo.
    pub const R7: ResponseType = ResponseType::R1;
}

/// A data phase attached to a command.
pub enum DataTransfer<'a> {
    /// Card-to-host transfer into the buffer.
    Read(&'a mut [u8]),
    /// Host-to-card transfer from the buffer.
    Write(&'a [u8]),
}

/// A single SD/MMC command.
pub struct SdCommand<'a> {
    /// The command opcode.
    pub opcode: SdOpcode,
    /// The response class expected from this command.
    pub response_type: ResponseType,
    /// The 32-bit command argument.
    pub argument: u32,
    /// Response words captured by the backend.
    pub response: [u32; 4],
    /// Optional data phase.
    pub data: Option<DataTransfer<'a>>,
}

impl<'a> SdCommand<'a> {
    /// Build a command with no data phase.
    pub fn new(opcode: SdOpcode, response_type: ResponseType, argument: u32) -> Self {
        Self {
            opcode,
            response_type,
            argument,
            response: [0; 4],
            data: None,
        }
    }

    /// Attach a card-to-host data phase.
    pub fn with_read(mut self, buffer: &'a mut [u8]) -> Self {
        self.data = Some(DataTransfer::Read(buffer));
        self
    }

    /// Attach a host-to-card data phase.
    pub fn with_write(mut self, buffer: &'a [u8]) -> Self {
        self.data = Some(DataTransfer::Write(buffer));
        self
    }

    /// Size of the attached data phase in bytes, zero if none.
    pub fn data_len(&self) -> usize {
        match &self.data {
            Some(DataTransfer::Read(buffer)) => buffer.len(),
            Some(DataTransfer::Write(buffer)) => buffer.len(),
            None => 0,
        }
    }

    /// Whether this opcode transfers multiple blocks.
    pub fn is_multiple_block(&self) -> bool {
        matches!(
            self.opcode,
            SdOpcode::ReadMultipleBlocks | SdOpcode::WriteMultipleBlocks
        )
    }
}

// ============================================================================
// Operating Conditions Register
// ============================================================================

/// Card has finished power-up when set.
pub const OCR_BUSY: u32 = 0x8000_0000;

/// Card capacity status: block addressing when set.
pub const OCR_HIGH_CAPACITY: u32 = 0x4000_0000;

/// Voltage window bits.
pub const OCR_VOLTAGE_MASK: u32 = 0x007F_FF80;

/// Access mode bits requested alongside the voltage window.
pub const OCR_ACCESS_MODE: u32 = 0x6000_0000;

/// CMD8 argument: 2.7-3.6V plus the 0xAA check pattern.
pub const INTERFACE_CONDITION_ARGUMENT: u32 = 0x1AA;

// ============================================================================
// Card Status (R1) bits
// ============================================================================

/// The card can accept data.
pub const CARD_STATUS_READY_FOR_DATA: u32 = 1 << 8;

/// Current state field.
pub const CARD_STATUS_CURRENT_STATE: u32 = 0xF << 9;

/// The card is in the transfer state.
pub const CARD_STATUS_STATE_TRANSFER: u32 = 0x4 << 9;

/// The card is programming flash.
pub const CARD_STATUS_STATE_PROGRAM: u32 = 0x7 << 9;

/// Any bit outside the benign status fields indicates a card error.
pub const CARD_STATUS_ERROR_MASK: u32 = !0x0206_BF7F;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_classes_carry_expected_flags() {
        assert!(ResponseType::R1.contains(ResponseType::PRESENT));
        assert!(ResponseType::R1.contains(ResponseType::OPCODE));
        assert!(!ResponseType::R1.contains(ResponseType::BUSY));
        assert!(ResponseType::R1B.contains(ResponseType::BUSY));
        assert!(ResponseType::R2.contains(ResponseType::LENGTH_136));
        assert_eq!(ResponseType::R3, ResponseType::PRESENT);
        assert_eq!(ResponseType::NONE, ResponseType::empty());
    }

    #[test]
    fn data_phase_accounting() {
        let mut buffer = [0u8; 512];
        let command = SdCommand::new(SdOpcode::ReadSingleBlock, ResponseType::R1, 0)
            .with_read(&mut buffer);
        assert_eq!(command.data_len(), 512);
        assert!(!command.is_multiple_block());

        let command = SdCommand::new(SdOpcode::WriteMultipleBlocks, ResponseType::R1, 0);
        assert_eq!(command.data_len(), 0);
        assert!(command.is_multiple_block());
    }
}
