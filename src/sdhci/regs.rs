//! Standard SD Host Controller Register Definitions
//!
//! This module defines the standard host-controller register block and its
//! bitfields. All registers are accessed as 32-bit words; narrower
//! hardware registers share a word with their neighbors (block size and
//! block count, command and transfer mode, clock control and the software
//! reset bits).

// ============================================================================
// Register Offsets
// ============================================================================

/// The standard host-controller register block, indexed by byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SdRegister {
    /// SDMA system address / second argument.
    SdmaAddress = 0x00,
    /// Block size (low half) and block count (high half).
    BlockSizeCount = 0x04,
    /// Command argument.
    Argument1 = 0x08,
    /// Transfer mode (low half) and command (high half).
    Command = 0x0C,
    /// Response bits 31:0.
    Response10 = 0x10,
    /// Response bits 63:32.
    Response32 = 0x14,
    /// Response bits 95:64.
    Response54 = 0x18,
    /// Response bits 127:96.
    Response76 = 0x1C,
    /// Buffer data port for polled FIFO transfer.
    BufferDataPort = 0x20,
    /// Present state.
    PresentState = 0x24,
    /// Host control, power control, block gap, wakeup.
    HostControl = 0x28,
    /// Clock control, timeout control, software reset.
    ClockControl = 0x2C,
    /// Interrupt status.
    InterruptStatus = 0x30,
    /// Interrupt status enable.
    InterruptStatusEnable = 0x34,
    /// Interrupt signal enable.
    InterruptSignalEnable = 0x38,
    /// Auto CMD error status and host control 2.
    ControlStatus2 = 0x3C,
    /// Capabilities, bits 31:0.
    Capabilities = 0x40,
    /// Capabilities, bits 63:32.
    Capabilities2 = 0x44,
    /// Maximum current capabilities.
    MaxCapabilities = 0x48,
    /// Force event register.
    ForceEvent = 0x50,
    /// ADMA error status.
    AdmaErrorStatus = 0x54,
    /// ADMA system address, low word.
    AdmaAddressLow = 0x58,
    /// ADMA system address, high word.
    AdmaAddressHigh = 0x5C,
    /// Slot interrupt status (low half) and version (high half).
    SlotStatusVersion = 0xFC,
}

impl SdRegister {
    /// Byte offset of the register within the block.
    pub const fn offset(self) -> usize {
        self as u32 as usize
    }
}

// ============================================================================
// Block Size/Count Register (0x04) Bitfields
// ============================================================================

/// SDMA buffer boundary: 512 KB.
pub const SIZE_SDMA_BOUNDARY_512K: u32 = 0x7 << 12;

/// Block count shift within the combined register.
pub const SIZE_BLOCK_COUNT_SHIFT: u32 = 16;

// ============================================================================
// Command Register (0x0C) Bitfields
// ============================================================================

/// DMA enable.
pub const COMMAND_DMA_ENABLE: u32 = 1 << 0;

/// Block count register is valid.
pub const COMMAND_BLOCK_COUNT_ENABLE: u32 = 1 << 1;

/// Issue CMD12 automatically after the transfer.
pub const COMMAND_AUTO_COMMAND12_ENABLE: u32 = 1 << 2;

/// Data transfer direction: card to host.
pub const COMMAND_TRANSFER_READ: u32 = 1 << 4;

/// Data transfer direction: host to card.
pub const COMMAND_TRANSFER_WRITE: u32 = 0 << 4;

/// Multiple block transfer.
pub const COMMAND_MULTIPLE_BLOCKS: u32 = 1 << 5;

/// No response expected.
pub const COMMAND_RESPONSE_NONE: u32 = 0 << 16;

/// 136-bit response expected.
pub const COMMAND_RESPONSE_136: u32 = 1 << 16;

/// 48-bit response expected.
pub const COMMAND_RESPONSE_48: u32 = 2 << 16;

/// 48-bit response with a busy phase expected.
pub const COMMAND_RESPONSE_48_BUSY: u32 = 3 << 16;

/// Check the response CRC.
pub const COMMAND_CRC_CHECK_ENABLE: u32 = 1 << 19;

/// Check the response opcode.
pub const COMMAND_INDEX_CHECK_ENABLE: u32 = 1 << 20;

/// The command has a data phase.
pub const COMMAND_DATA_PRESENT: u32 = 1 << 21;

/// Command opcode shift.
pub const COMMAND_INDEX_SHIFT: u32 = 24;

// ============================================================================
// Present State Register (0x24) Bitfields
// ============================================================================

/// A command is already in flight.
pub const STATE_COMMAND_INHIBIT: u32 = 1 << 0;

/// The data lines are in use.
pub const STATE_DATA_INHIBIT: u32 = 1 << 1;

/// Data line active.
pub const STATE_DATA_LINE_ACTIVE: u32 = 1 << 2;

/// Write transfer active.
pub const STATE_WRITE_TRANSFER_ACTIVE: u32 = 1 << 8;

/// Read transfer active.
pub const STATE_READ_TRANSFER_ACTIVE: u32 = 1 << 9;

/// Buffer ready to accept write data.
pub const STATE_BUFFER_WRITE_ENABLE: u32 = 1 << 10;

/// Buffer holds read data.
pub const STATE_BUFFER_READ_ENABLE: u32 = 1 << 11;

/// A card is inserted.
pub const STATE_CARD_INSERTED: u32 = 1 << 16;

/// The card detect signal is stable.
pub const STATE_CARD_STATE_STABLE: u32 = 1 << 17;

/// Write protect switch level.
pub const STATE_WRITE_PROTECT_PIN_LEVEL: u32 = 1 << 19;

/// DAT[3:0] signal levels.
pub const STATE_DATA_LINE_LEVEL_MASK: u32 = 0xF << 20;

// ============================================================================
// Host Control Register (0x28) Bitfields
// ============================================================================

/// 1-bit data transfer width.
pub const HOST_CONTROL_DATA_1BIT: u32 = 0 << 1;

/// 4-bit data transfer width.
pub const HOST_CONTROL_DATA_4BIT: u32 = 1 << 1;

/// High-speed timing enable.
pub const HOST_CONTROL_HIGH_SPEED: u32 = 1 << 2;

/// 8-bit data transfer width.
pub const HOST_CONTROL_DATA_8BIT: u32 = 1 << 5;

/// Bus power enable.
pub const HOST_CONTROL_POWER_ENABLE: u32 = 1 << 8;

/// Bus voltage select: 1.8 V.
pub const HOST_CONTROL_POWER_1V8: u32 = 5 << 9;

/// Bus voltage select: 3.0 V.
pub const HOST_CONTROL_POWER_3V0: u32 = 6 << 9;

/// Bus voltage select: 3.3 V.
pub const HOST_CONTROL_POWER_3V3: u32 = 7 << 9;

/// Stop the current transfer at the next block gap.
pub const HOST_CONTROL_STOP_AT_BLOCK_GAP: u32 = 1 << 16;

/// Bus width field.
pub const HOST_CONTROL_BUS_WIDTH_MASK: u32 = HOST_CONTROL_DATA_4BIT | HOST_CONTROL_DATA_8BIT;

// ============================================================================
// Clock Control Register (0x2C) Bitfields
// ============================================================================

/// Internal clock enable.
pub const CLOCK_CONTROL_INTERNAL_CLOCK_ENABLE: u32 = 1 << 0;

/// Internal clock stable.
pub const CLOCK_CONTROL_CLOCK_STABLE: u32 = 1 << 1;

/// SD clock output enable.
pub const CLOCK_CONTROL_SD_CLOCK_ENABLE: u32 = 1 << 2;

/// Divisor field, low eight bits.
pub const CLOCK_CONTROL_DIVISOR_MASK: u32 = 0xFF;

/// Divisor field shift.
pub const CLOCK_CONTROL_DIVISOR_SHIFT: u32 = 8;

/// Divisor field, high two bits.
pub const CLOCK_CONTROL_DIVISOR_HIGH_MASK: u32 = 0x3 << 8;

/// Shift placing the high divisor bits at register bits 7:6.
pub const CLOCK_CONTROL_DIVISOR_HIGH_SHIFT: u32 = 8 - 6;

/// Data timeout counter field shift.
pub const CLOCK_CONTROL_TIMEOUT_SHIFT: u32 = 16;

/// Default data timeout counter value.
pub const CLOCK_CONTROL_DEFAULT_TIMEOUT: u32 = 14;

/// Software reset for the whole controller.
pub const CLOCK_CONTROL_RESET_ALL: u32 = 1 << 24;

/// Software reset for the command line.
pub const CLOCK_CONTROL_RESET_COMMAND_LINE: u32 = 1 << 25;

/// Software reset for the data line.
pub const CLOCK_CONTROL_RESET_DATA_LINE: u32 = 1 << 26;

// ============================================================================
// Capabilities Register (0x40) Bitfields
// ============================================================================

/// Base clock frequency field (pre-version-3 controllers).
pub const CAPABILITY_BASE_CLOCK_FREQUENCY_MASK: u32 = 0x3F;

/// Base clock frequency field (version 3 controllers).
pub const CAPABILITY_V3_BASE_CLOCK_FREQUENCY_MASK: u32 = 0xFF;

/// Base clock frequency field shift.
pub const CAPABILITY_BASE_CLOCK_FREQUENCY_SHIFT: u32 = 8;

/// ADMA2 support.
pub const CAPABILITY_ADMA2: u32 = 1 << 19;

/// High-speed support.
pub const CAPABILITY_HIGH_SPEED: u32 = 1 << 21;

/// SDMA support.
pub const CAPABILITY_SDMA: u32 = 1 << 22;

/// 3.3 V supply support.
pub const CAPABILITY_VOLTAGE_3V3: u32 = 1 << 24;

/// 3.0 V supply support.
pub const CAPABILITY_VOLTAGE_3V0: u32 = 1 << 25;

/// 1.8 V supply support.
pub const CAPABILITY_VOLTAGE_1V8: u32 = 1 << 26;

// ============================================================================
// Interrupt Status Register (0x30) Bitfields
// ============================================================================

/// Command complete.
pub const INT_STATUS_COMMAND_COMPLETE: u32 = 1 << 0;

/// Transfer complete.
pub const INT_STATUS_TRANSFER_COMPLETE: u32 = 1 << 1;

/// Block gap event.
pub const INT_STATUS_BLOCK_GAP_EVENT: u32 = 1 << 2;

/// DMA boundary interrupt.
pub const INT_STATUS_DMA_INTERRUPT: u32 = 1 << 3;

/// Buffer ready for write data.
pub const INT_STATUS_BUFFER_WRITE_READY: u32 = 1 << 4;

/// Buffer holds read data.
pub const INT_STATUS_BUFFER_READ_READY: u32 = 1 << 5;

/// Card inserted.
pub const INT_STATUS_CARD_INSERTION: u32 = 1 << 6;

/// Card removed.
pub const INT_STATUS_CARD_REMOVAL: u32 = 1 << 7;

/// Some error bit is set.
pub const INT_STATUS_ERROR_INTERRUPT: u32 = 1 << 15;

/// The command timed out.
pub const INT_STATUS_COMMAND_TIMEOUT_ERROR: u32 = 1 << 16;

/// Command CRC error.
pub const INT_STATUS_COMMAND_CRC_ERROR: u32 = 1 << 17;

/// Command end bit error.
pub const INT_STATUS_COMMAND_END_BIT_ERROR: u32 = 1 << 18;

/// Command index error.
pub const INT_STATUS_COMMAND_INDEX_ERROR: u32 = 1 << 19;

/// The data phase timed out.
pub const INT_STATUS_DATA_TIMEOUT_ERROR: u32 = 1 << 20;

/// Data CRC error.
pub const INT_STATUS_DATA_CRC_ERROR: u32 = 1 << 21;

/// Data end bit error.
pub const INT_STATUS_DATA_END_BIT_ERROR: u32 = 1 << 22;

/// Current limit error.
pub const INT_STATUS_CURRENT_LIMIT_ERROR: u32 = 1 << 23;

/// Auto CMD12 error.
pub const INT_STATUS_AUTO_COMMAND12_ERROR: u32 = 1 << 24;

/// ADMA error.
pub const INT_STATUS_ADMA_ERROR: u32 = 1 << 25;

/// All interrupt status bits.
pub const INT_STATUS_ALL_MASK: u32 = 0xFFFF_FFFF;

/// Data-phase error bits that warrant a data line reset.
pub const INT_STATUS_DATA_ERROR_MASK: u32 =
    INT_STATUS_DATA_TIMEOUT_ERROR | INT_STATUS_DATA_CRC_ERROR | INT_STATUS_DATA_END_BIT_ERROR;

/// Every error bit.
pub const INT_ENABLE_ERROR_MASK: u32 = INT_STATUS_COMMAND_TIMEOUT_ERROR
    | INT_STATUS_COMMAND_CRC_ERROR
    | INT_STATUS_COMMAND_END_BIT_ERROR
    | INT_STATUS_COMMAND_INDEX_ERROR
    | INT_STATUS_DATA_TIMEOUT_ERROR
    | INT_STATUS_DATA_CRC_ERROR
    | INT_STATUS_DATA_END_BIT_ERROR
    | INT_STATUS_CURRENT_LIMIT_ERROR
    | INT_STATUS_AUTO_COMMAND12_ERROR
    | INT_STATUS_ADMA_ERROR;

/// Status bits latched while running polled.
pub const INT_STATUS_ENABLE_DEFAULT_MASK: u32 = INT_ENABLE_ERROR_MASK
    | INT_STATUS_CARD_INSERTION
    | INT_STATUS_CARD_REMOVAL
    | INT_STATUS_BUFFER_WRITE_READY
    | INT_STATUS_BUFFER_READ_READY
    | INT_STATUS_DMA_INTERRUPT
    | INT_STATUS_TRANSFER_COMPLETE
    | INT_STATUS_COMMAND_COMPLETE;

// ============================================================================
// Host Controller Version Register (0xFC, high half) Bitfields
// ============================================================================

/// Specification version field.
pub const HOST_VERSION_MASK: u32 = 0x00FF;

/// Host controller specification version 1.00.
pub const HOST_VERSION_1: u32 = 0;

/// Host controller specification version 2.00.
pub const HOST_VERSION_2: u32 = 1;

/// Host controller specification version 3.00.
pub const HOST_VERSION_3: u32 = 2;

// ============================================================================
// Clock divisor limits
// ============================================================================

/// Largest divisor on pre-version-3 controllers (powers of two).
pub const V2_MAX_DIVISOR: u32 = 0x100;

/// Largest divisor on version-3 controllers (even steps).
pub const V3_MAX_DIVISOR: u32 = 2046;
