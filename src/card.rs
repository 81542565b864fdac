//! Card metadata: identification, specification versions, and the decode
//! of the card-specific data structures.
//!
//! The decode routines here are pure functions over the raw response words
//! so they can be exercised directly against reference values.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Largest block length the stack will program, in bytes.
pub const MAX_BLOCK_SIZE: usize = 512;

/// Number of general-purpose partitions an MMC device can carry.
pub const GENERAL_PARTITION_COUNT: usize = 4;

/// Card specification version.
///
/// The variant order is significant: everything below `MmcMinimum` is an
/// SD card and everything at or above it is an MMC card, so family checks
/// are a single comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SdVersion {
    /// Not yet negotiated.
    Invalid,
    /// SD physical layer 1.0.
    Sd1p0,
    /// SD physical layer 1.10.
    Sd1p10,
    /// SD physical layer 2.0.
    Sd2,
    /// SD physical layer 3.0.
    Sd3,
    /// Upper bound of the SD family.
    SdMaximum,
    /// Lower bound of the MMC family.
    MmcMinimum,
    /// MMC 1.2.
    Mmc1p2,
    /// MMC 1.4.
    Mmc1p4,
    /// MMC 2.2.
    Mmc2p2,
    /// MMC 3.x.
    Mmc3,
    /// MMC 4.0.
    Mmc4,
    /// MMC 4.1.
    Mmc4p1,
    /// MMC 4.2.
    Mmc4p2,
    /// MMC 4.3.
    Mmc4p3,
    /// MMC 4.41.
    Mmc4p41,
    /// MMC 4.5.
    Mmc4p5,
    /// Upper bound of the MMC family.
    MmcMaximum,
}

impl SdVersion {
    /// Whether this version identifies an SD (not MMC) card.
    pub fn is_sd(self) -> bool {
        self < SdVersion::MmcMinimum
    }
}

/// Bus clock classes negotiated by the engine.
///
/// The bus is never programmed to an arbitrary frequency; negotiation
/// selects one of these fixed rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClockSpeed {
    /// Not yet negotiated.
    Invalid,
    /// 400 kHz identification clock.
    Clock400kHz,
    /// 20 MHz legacy MMC transfer clock.
    Clock20MHz,
    /// 25 MHz SD default speed.
    Clock25MHz,
    /// 26 MHz MMC high speed.
    Clock26MHz,
    /// 50 MHz SD high speed.
    Clock50MHz,
    /// 52 MHz MMC high speed.
    Clock52MHz,
}

impl ClockSpeed {
    /// The clock rate in Hertz.
    pub const fn hertz(self) -> u32 {
        match self {
            ClockSpeed::Invalid => 0,
            ClockSpeed::Clock400kHz => 400_000,
            ClockSpeed::Clock20MHz => 20_000_000,
            ClockSpeed::Clock25MHz => 25_000_000,
            ClockSpeed::Clock26MHz => 26_000_000,
            ClockSpeed::Clock50MHz => 50_000_000,
            ClockSpeed::Clock52MHz => 52_000_000,
        }
    }

    /// The highest class whose rate does not exceed the given frequency.
    pub fn from_frequency(hertz: u32) -> ClockSpeed {
        const LADDER: [ClockSpeed; 6] = [
            ClockSpeed::Clock52MHz,
            ClockSpeed::Clock50MHz,
            ClockSpeed::Clock26MHz,
            ClockSpeed::Clock25MHz,
            ClockSpeed::Clock20MHz,
            ClockSpeed::Clock400kHz,
        ];

        for class in LADDER {
            if class.hertz() <= hertz {
                return class;
            }
        }

        ClockSpeed::Invalid
    }
}

// ============================================================================
// Card Identification (CID)
// ============================================================================

/// Card identification register contents.
///
/// The layout matches the 16 response bytes of the identification command
/// as the controller captures them, least significant byte first.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy)]
#[repr(C)]
pub struct CardIdentification {
    /// CRC7 of the register, shifted into the low byte.
    pub crc7: u8,
    /// Manufacturing date, packed year/month.
    pub manufacturing_date: [u8; 2],
    /// Product serial number.
    pub serial_number: [u8; 4],
    /// Product revision, BCD major.minor.
    pub product_revision: u8,
    /// ASCII product name.
    pub product_name: [u8; 5],
    /// OEM/application id.
    pub oem_id: [u8; 2],
    /// Manufacturer id assigned by the card association.
    pub manufacturer_id: u8,
}

impl CardIdentification {
    /// Reinterpret the four response words of CMD2/CMD10 as a CID.
    pub fn from_response(response: &[u32; 4]) -> Self {
        zerocopy::transmute!(*response)
    }
}

// ============================================================================
// Card Specific Data (CSD), from the four response words
// ============================================================================

/// Transfer rate unit exponent field.
pub const CSD0_FREQUENCY_BASE_MASK: u32 = 0x7;

/// Transfer rate multiplier index shift.
pub const CSD0_FREQUENCY_MULTIPLIER_SHIFT: u32 = 3;

/// Transfer rate multiplier index mask.
pub const CSD0_FREQUENCY_MULTIPLIER_MASK: u32 = 0xF;

/// MMC specification version field shift.
pub const CSD0_MMC_VERSION_SHIFT: u32 = 26;

/// MMC specification version field mask.
pub const CSD0_MMC_VERSION_MASK: u32 = 0xF;

/// Read block length exponent shift.
pub const CSD1_READ_BLOCK_LENGTH_SHIFT: u32 = 16;

/// Read block length exponent mask.
pub const CSD1_READ_BLOCK_LENGTH_MASK: u32 = 0x0F;

/// Write block length exponent shift.
pub const CSD1_WRITE_BLOCK_LENGTH_SHIFT: u32 = 22;

/// Write block length exponent mask.
pub const CSD1_WRITE_BLOCK_LENGTH_MASK: u32 = 0x0F;

/// High-capacity device size, upper bits.
pub const CSD1_HIGH_CAPACITY_MASK: u32 = 0x3F;

/// High-capacity device size, upper bit position.
pub const CSD1_HIGH_CAPACITY_SHIFT: u32 = 16;

/// High-capacity device size, lower bits.
pub const CSD2_HIGH_CAPACITY_MASK: u32 = 0xFFFF_0000;

/// High-capacity device size, lower bit position.
pub const CSD2_HIGH_CAPACITY_SHIFT: u32 = 16;

/// High-capacity capacity multiplier (fixed).
pub const CSD_HIGH_CAPACITY_MULTIPLIER: u32 = 8;

/// Standard-capacity device size, upper bits.
pub const CSD1_CAPACITY_MASK: u32 = 0x3FF;

/// Standard-capacity device size, upper bit position.
pub const CSD1_CAPACITY_SHIFT: u32 = 2;

/// Standard-capacity device size, lower bits.
pub const CSD2_CAPACITY_MASK: u32 = 0xC000_0000;

/// Standard-capacity device size, lower bit position.
pub const CSD2_CAPACITY_SHIFT: u32 = 30;

/// Standard-capacity multiplier field.
pub const CSD2_CAPACITY_MULTIPLIER_MASK: u32 = 0x0003_8000;

/// Standard-capacity multiplier field position.
pub const CSD2_CAPACITY_MULTIPLIER_SHIFT: u32 = 15;

/// MMC erase group size field.
pub const CSD2_ERASE_GROUP_SIZE_MASK: u32 = 0x0000_7C00;

/// MMC erase group size field position.
pub const CSD2_ERASE_GROUP_SIZE_SHIFT: u32 = 10;

/// MMC erase group multiplier field.
pub const CSD2_ERASE_GROUP_MULTIPLIER_MASK: u32 = 0x0000_03E0;

/// MMC erase group multiplier field position.
pub const CSD2_ERASE_GROUP_MULTIPLIER_SHIFT: u32 = 5;

/// Transfer rate multipliers, in tenths, indexed by the CSD field.
const FREQUENCY_MULTIPLIERS: [u32; 16] = [
    0, 10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80,
];

/// Geometry and identity decoded from the card-specific data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedCsd {
    /// The (possibly refined) specification version.
    pub version: SdVersion,
    /// Clock class derived from the transfer rate fields. SD negotiation
    /// replaces this entirely; MMC negotiation may.
    pub clock_speed: ClockSpeed,
    /// Read block length in bytes, clamped to [`MAX_BLOCK_SIZE`].
    pub read_block_length: u32,
    /// Write block length in bytes, clamped to [`MAX_BLOCK_SIZE`].
    pub write_block_length: u32,
    /// User-area capacity in bytes.
    pub user_capacity: u64,
}

/// Decode the card-specific data response words.
///
/// For cards that are not SD the specification version is refined from the
/// SPEC_VERS field. The user capacity is computed from the raw read block
/// length before the block lengths are clamped, so oversized block
/// exponents still yield the full advertised capacity.
pub fn decode_csd(words: &[u32; 4], version: SdVersion, high_capacity: bool) -> DecodedCsd {
    let version = if !version.is_sd() {
        match (words[0] >> CSD0_MMC_VERSION_SHIFT) & CSD0_MMC_VERSION_MASK {
            1 => SdVersion::Mmc1p4,
            2 => SdVersion::Mmc2p2,
            3 => SdVersion::Mmc3,
            4 => SdVersion::Mmc4,
            _ => SdVersion::Mmc1p2,
        }
    } else {
        version
    };

    let mut frequency = 10_000;
    let mut exponent = words[0] & CSD0_FREQUENCY_BASE_MASK;
    while exponent != 0 {
        frequency *= 10;
        exponent -= 1;
    }

    let multiplier_index =
        (words[0] >> CSD0_FREQUENCY_MULTIPLIER_SHIFT) & CSD0_FREQUENCY_MULTIPLIER_MASK;

    let clock_speed =
        ClockSpeed::from_frequency(frequency * FREQUENCY_MULTIPLIERS[multiplier_index as usize]);

    let read_block_length =
        1 << ((words[1] >> CSD1_READ_BLOCK_LENGTH_SHIFT) & CSD1_READ_BLOCK_LENGTH_MASK);

    let write_block_length = if version.is_sd() {
        read_block_length
    } else {
        1 << ((words[1] >> CSD1_WRITE_BLOCK_LENGTH_SHIFT) & CSD1_WRITE_BLOCK_LENGTH_MASK)
    };

    let (capacity_base, capacity_shift) = if high_capacity {
        let base = (((words[1] & CSD1_HIGH_CAPACITY_MASK) as u64) << CSD1_HIGH_CAPACITY_SHIFT)
            | (((words[2] & CSD2_HIGH_CAPACITY_MASK) as u64) >> CSD2_HIGH_CAPACITY_SHIFT);

        (base, CSD_HIGH_CAPACITY_MULTIPLIER)
    } else {
        let base = (((words[1] & CSD1_CAPACITY_MASK) as u64) << CSD1_CAPACITY_SHIFT)
            | (((words[2] & CSD2_CAPACITY_MASK) as u64) >> CSD2_CAPACITY_SHIFT);

        let shift = (words[2] & CSD2_CAPACITY_MULTIPLIER_MASK) >> CSD2_CAPACITY_MULTIPLIER_SHIFT;
        (base, shift)
    };

    let user_capacity = ((capacity_base + 1) << (capacity_shift + 2)) * read_block_length as u64;

    DecodedCsd {
        version,
        clock_speed,
        read_block_length: read_block_length.min(MAX_BLOCK_SIZE as u32),
        write_block_length: write_block_length.min(MAX_BLOCK_SIZE as u32),
        user_capacity,
    }
}

// ============================================================================
// SD Configuration Register (SCR)
// ============================================================================

/// Specification version field shift in the first SCR word.
pub const CONFIGURATION_REGISTER_VERSION_SHIFT: u32 = 24;

/// Specification version field mask.
pub const CONFIGURATION_REGISTER_VERSION_MASK: u32 = 0xF;

/// Version 3.0 flag within the version-2 encoding.
pub const CONFIGURATION_REGISTER_VERSION3_SHIFT: u32 = 15;

/// The card supports 4-bit data transfer.
pub const CONFIGURATION_REGISTER_DATA_4BIT: u32 = 0x0004_0000;

/// Decode the first SD configuration register word.
///
/// Returns the specification version and whether the card supports 4-bit
/// transfers. The word must already be in host order (see
/// [`status_word`]).
pub fn decode_configuration_register(word: u32) -> (SdVersion, bool) {
    let version = match (word >> CONFIGURATION_REGISTER_VERSION_SHIFT)
        & CONFIGURATION_REGISTER_VERSION_MASK
    {
        1 => SdVersion::Sd1p10,
        2 => {
            if (word >> CONFIGURATION_REGISTER_VERSION3_SHIFT) & 0x1 != 0 {
                SdVersion::Sd3
            } else {
                SdVersion::Sd2
            }
        }
        _ => SdVersion::Sd1p0,
    };

    let four_bit = word & CONFIGURATION_REGISTER_DATA_4BIT != 0;
    (version, four_bit)
}

// ============================================================================
// Switch function status
// ============================================================================

/// Function-switch mode: query support without changing anything.
pub const SWITCH_CHECK: u32 = 0;

/// Function-switch mode: apply the new function.
pub const SWITCH_SWITCH: u32 = 1;

/// Status word 3: group 1 supports high speed.
pub const SWITCH_STATUS_3_HIGH_SPEED_SUPPORTED: u32 = 0x0002_0000;

/// Status word 4: selected-function field for group 1.
pub const SWITCH_STATUS_4_HIGH_SPEED_MASK: u32 = 0x0F00_0000;

/// Status word 4: high speed was selected.
pub const SWITCH_STATUS_4_HIGH_SPEED_VALUE: u32 = 0x0100_0000;

/// Status word 7: the high-speed function is still busy.
pub const SWITCH_STATUS_7_HIGH_SPEED_BUSY: u32 = 0x0002_0000;

/// Read the 32-bit word at the given index out of a data-phase buffer.
///
/// Wide card registers (SCR, switch status) arrive over the data lines
/// most significant byte first, so the words are big-endian in the buffer.
pub fn status_word(buffer: &[u8], index: usize) -> u32 {
    let offset = index * 4;
    u32::from_be_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

// ============================================================================
// Extended Card Specific Data (MMC)
// ============================================================================

/// General partition size, three bytes per partition.
pub const EXTENDED_CARD_DATA_GENERAL_PARTITION_SIZE: usize = 143;

/// Partitions attribute byte.
pub const EXTENDED_CARD_DATA_PARTITIONS_ATTRIBUTE: usize = 156;

/// Partitioning support byte.
pub const EXTENDED_CARD_DATA_PARTITIONING_SUPPORT: usize = 160;

/// RPMB partition size in 128 KB units.
pub const EXTENDED_CARD_DATA_RPMB_SIZE: usize = 168;

/// Erase group definition selector.
pub const EXTENDED_CARD_DATA_ERASE_GROUP_DEF: usize = 175;

/// Partition configuration byte.
pub const EXTENDED_CARD_DATA_PARTITION_CONFIGURATION: usize = 179;

/// Bus width byte (write-only on the card side).
pub const EXTENDED_CARD_DATA_BUS_WIDTH: usize = 183;

/// High-speed timing selector.
pub const EXTENDED_CARD_DATA_HIGH_SPEED: usize = 185;

/// Extended CSD revision.
pub const EXTENDED_CARD_DATA_REVISION: usize = 192;

/// Card type byte.
pub const EXTENDED_CARD_DATA_CARD_TYPE: usize = 196;

/// Sector count, four bytes little endian.
pub const EXTENDED_CARD_DATA_SECTOR_COUNT: usize = 212;

/// Write protect group size.
pub const EXTENDED_CARD_DATA_WRITE_PROTECT_GROUP_SIZE: usize = 221;

/// High-capacity erase group size.
pub const EXTENDED_CARD_DATA_ERASE_GROUP_SIZE: usize = 224;

/// Boot partition size in 128 KB units.
pub const EXTENDED_CARD_DATA_BOOT_SIZE: usize = 226;

/// Shift converting a 128 KB partition-size unit to bytes.
pub const EXTENDED_CARD_DATA_PARTITION_SHIFT: u32 = 17;

/// Sector counts only override the CSD capacity above this size.
pub const EXTENDED_SECTOR_COUNT_MINIMUM: u64 = 2 * 1024 * 1024 * 1024;

/// No partition configuration recorded.
pub const PARTITION_NONE: u8 = 0xFF;

/// The device supports partitioning.
pub const PARTITION_SUPPORT: u8 = 0x01;

/// Enhanced attributes in the partitions-attribute byte.
pub const PARTITION_ENHANCED_ATTRIBUTE: u8 = 0x1F;

/// Valid bits of the card type byte.
pub const EXTENDED_CARD_DATA_CARD_TYPE_MASK: u8 = 0x0F;

/// The card supports 52 MHz high-speed transfer.
pub const CARD_TYPE_HIGH_SPEED_52MHZ: u8 = 0x02;

/// Bus width byte value for 8-bit transfer.
pub const EXTENDED_CARD_DATA_BUS_WIDTH_8: u8 = 2;

/// Bus width byte value for 4-bit transfer.
pub const EXTENDED_CARD_DATA_BUS_WIDTH_4: u8 = 1;

/// Bus width byte value for 1-bit transfer.
pub const EXTENDED_CARD_DATA_BUS_WIDTH_1: u8 = 0;

/// The extended card-specific data block of an MMC device.
pub struct ExtendedCardData(pub [u8; MAX_BLOCK_SIZE]);

impl ExtendedCardData {
    /// Extended CSD revision byte.
    pub fn revision(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_REVISION]
    }

    /// Device sector count.
    pub fn sector_count(&self) -> u64 {
        let offset = EXTENDED_CARD_DATA_SECTOR_COUNT;
        u32::from_le_bytes([
            self.0[offset],
            self.0[offset + 1],
            self.0[offset + 2],
            self.0[offset + 3],
        ]) as u64
    }

    /// Card type byte, masked to its defined bits.
    pub fn card_type(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_CARD_TYPE] & EXTENDED_CARD_DATA_CARD_TYPE_MASK
    }

    /// High-speed timing byte.
    pub fn high_speed(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_HIGH_SPEED]
    }

    /// Partitioning support byte.
    pub fn partitioning_support(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_PARTITIONING_SUPPORT]
    }

    /// Partitions attribute byte.
    pub fn partitions_attribute(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_PARTITIONS_ATTRIBUTE]
    }

    /// Partition configuration byte.
    pub fn partition_configuration(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_PARTITION_CONFIGURATION]
    }

    /// High-capacity erase group size byte.
    pub fn erase_group_size(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_ERASE_GROUP_SIZE]
    }

    /// Write protect group size byte.
    pub fn write_protect_group_size(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_WRITE_PROTECT_GROUP_SIZE]
    }

    /// Boot partition size byte.
    pub fn boot_size(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_BOOT_SIZE]
    }

    /// RPMB partition size byte.
    pub fn rpmb_size(&self) -> u8 {
        self.0[EXTENDED_CARD_DATA_RPMB_SIZE]
    }

    /// Raw size field of the given general partition, in erase groups
    /// times write-protect groups.
    pub fn general_partition_size(&self, index: usize) -> u64 {
        let offset = EXTENDED_CARD_DATA_GENERAL_PARTITION_SIZE + index * 3;
        ((self.0[offset + 2] as u64) << 16)
            | ((self.0[offset + 1] as u64) << 8)
            | self.0[offset] as u64
    }
}
