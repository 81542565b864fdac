//! Generic SD/MMC controller engine.
//!
//! This module owns the card-protocol state machine: reset and voltage
//! probing, operating-condition negotiation (with the CMD55-failure escape
//! into the MMC path), identification and addressing, card-specific-data
//! decode, erase-group and partition configuration, frequency and bus-width
//! negotiation, and the polled block I/O entry points with bounded retry
//! through error recovery.
//!
//! The engine is generic over its backend: every hardware touch goes
//! through the [`SdHost`] operation table, so a controller with a
//! non-standard register layout only has to supply its own implementation.

use crate::card::{
    self, CardIdentification, ClockSpeed, ExtendedCardData, SdVersion, GENERAL_PARTITION_COUNT,
    MAX_BLOCK_SIZE,
};
use crate::command::{
    ResponseType, SdCommand, SdOpcode, CARD_STATUS_CURRENT_STATE, CARD_STATUS_ERROR_MASK,
    CARD_STATUS_READY_FOR_DATA, CARD_STATUS_STATE_PROGRAM, CARD_STATUS_STATE_TRANSFER,
    INTERFACE_CONDITION_ARGUMENT, OCR_ACCESS_MODE, OCR_BUSY, OCR_HIGH_CAPACITY, OCR_VOLTAGE_MASK,
};
use crate::error::SdError;
use crate::host::{BusParameters, Capabilities, InitPhase, ResetFlags, SdHost};
use crate::sdhci::{MmioRegisters, StandardHost, StandardSdHost};
use crate::time::{self, Timeout};

/// Times a failing block transfer is retried through error recovery.
pub const IO_RETRIES: u32 = 5;

/// Default ceiling on blocks moved by a single command.
pub const MAX_BLOCK_COUNT: u32 = 0xFFFF;

/// Full reset attempts before the card is declared missing.
const CARD_INITIALIZE_RETRY_COUNT: u32 = 3;

/// Interface-condition (CMD8) attempts.
const INTERFACE_CONDITION_RETRY_COUNT: u32 = 10;

/// Operating-condition poll iterations.
const OPERATING_CONDITION_RETRY_COUNT: u32 = 1000;

/// Configuration-register (ACMD51) read attempts.
const CONFIGURATION_REGISTER_RETRY_COUNT: u32 = 10;

/// Switch-function busy poll attempts.
const SWITCH_RETRY_COUNT: u32 = 4;

/// Block-length programming attempts.
const SET_BLOCK_LENGTH_RETRY_COUNT: u32 = 10;

/// Settle delay around card resets and operating-condition polls.
const CARD_DELAY_US: u64 = 1_000;

/// Delay after CMD0 before the card will take another command.
const POST_RESET_DELAY_US: u64 = 2_000;

/// Budget for card-status (CMD13) polls.
const STATUS_TIMEOUT_US: u64 = 60_000_000;

/// Platform query callback: card present, or write protected.
pub type StatusQuery = fn() -> Result<bool, SdError>;

/// Optional platform queries consulted before reset and initialization.
///
/// Firmware typically wires these to GPIO reads captured in statics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotCallbacks {
    /// Whether a card is in the slot.
    pub card_detect: Option<StatusQuery>,
    /// Whether the write-protect switch is set.
    pub write_protect: Option<StatusQuery>,
}

/// Creation parameters for an SD controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdControllerParameters {
    /// Physical base address of a standard host-controller register
    /// block. Set exactly when no override backend is supplied.
    pub controller_base: Option<usize>,
    /// Supported voltage windows; derived from controller capabilities
    /// when left empty.
    pub voltages: crate::host::Voltages,
    /// Base clock in Hertz; derived from controller capabilities when
    /// left zero.
    pub fundamental_clock: u32,
    /// Host capability flags.
    pub host_capabilities: Capabilities,
    /// Optional platform queries.
    pub callbacks: SlotCallbacks,
}

/// Media geometry reported to block I/O consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaParameters {
    /// Number of blocks in the user area.
    pub block_count: u64,
    /// Block size in bytes.
    pub block_size: u32,
}

/// A single card slot: the protocol engine bound to one backend.
pub struct SdController<H: SdHost> {
    host: H,
    callbacks: SlotCallbacks,
    bus: BusParameters,
    card_capabilities: Capabilities,
    version: SdVersion,
    card_address: u16,
    bus_width: u32,
    clock_speed: ClockSpeed,
    high_capacity: bool,
    write_protected: bool,
    read_block_length: u32,
    write_block_length: u32,
    user_capacity: u64,
    boot_capacity: u64,
    rpmb_capacity: u64,
    general_partition_capacity: [u64; GENERAL_PARTITION_COUNT],
    erase_group_size: u32,
    card_specific_data: [u32; 4],
    partition_configuration: u8,
    max_blocks_per_transfer: u32,
}

impl SdController<StandardSdHost> {
    /// Create a controller driving the standard backend at the register
    /// base given in the parameters.
    pub fn create(parameters: &SdControllerParameters) -> Result<Self, SdError> {
        let Some(base) = parameters.controller_base else {
            return Err(SdError::InvalidParameter);
        };

        Ok(Self::from_parts(
            StandardHost::new(MmioRegisters::new(base)),
            parameters,
        ))
    }
}

impl<H: SdHost> SdController<H> {
    /// Create a controller with a caller-supplied backend instead of the
    /// standard one. The parameters must not also carry a standard
    /// register base.
    pub fn with_host(host: H, parameters: &SdControllerParameters) -> Result<Self, SdError> {
        if parameters.controller_base.is_some() {
            return Err(SdError::InvalidParameter);
        }

        Ok(Self::from_parts(host, parameters))
    }

    fn from_parts(host: H, parameters: &SdControllerParameters) -> Self {
        Self {
            host,
            callbacks: parameters.callbacks,
            bus: BusParameters {
                voltages: parameters.voltages,
                fundamental_clock: parameters.fundamental_clock,
                host_capabilities: parameters.host_capabilities,
            },
            card_capabilities: Capabilities::empty(),
            version: SdVersion::Invalid,
            card_address: 0,
            bus_width: 0,
            clock_speed: ClockSpeed::Invalid,
            high_capacity: false,
            write_protected: false,
            read_block_length: 0,
            write_block_length: 0,
            user_capacity: 0,
            boot_capacity: 0,
            rpmb_capacity: 0,
            general_partition_capacity: [0; GENERAL_PARTITION_COUNT],
            erase_group_size: 0,
            card_specific_data: [0; 4],
            partition_configuration: card::PARTITION_NONE,
            max_blocks_per_transfer: MAX_BLOCK_COUNT,
        }
    }

    /// The negotiated specification version.
    pub fn version(&self) -> SdVersion {
        self.version
    }

    /// Whether the card negotiated as SD rather than MMC.
    pub fn is_sd_card(&self) -> bool {
        self.version.is_sd()
    }

    /// The negotiated bus width.
    pub fn bus_width(&self) -> u32 {
        self.bus_width
    }

    /// The negotiated clock class.
    pub fn clock_speed(&self) -> ClockSpeed {
        self.clock_speed
    }

    /// Effective capabilities: card capabilities clipped to the host's.
    pub fn capabilities(&self) -> Capabilities {
        self.card_capabilities
    }

    /// Whether the card uses block rather than byte addressing.
    pub fn high_capacity(&self) -> bool {
        self.high_capacity
    }

    /// Erase group size recorded during initialization.
    pub fn erase_group_size(&self) -> u32 {
        self.erase_group_size
    }

    /// The partition configuration byte, [`card::PARTITION_NONE`] if the
    /// card records none.
    pub fn partition_configuration(&self) -> u8 {
        self.partition_configuration
    }

    /// Boot partition capacity in bytes.
    pub fn boot_capacity(&self) -> u64 {
        self.boot_capacity
    }

    /// RPMB partition capacity in bytes.
    pub fn rpmb_capacity(&self) -> u64 {
        self.rpmb_capacity
    }

    /// Capacity of the given general partition in bytes.
    pub fn general_partition_capacity(&self, index: usize) -> u64 {
        self.general_partition_capacity[index]
    }

    /// Cap the number of blocks moved by one command.
    pub fn set_max_blocks_per_transfer(&mut self, blocks: u32) {
        self.max_blocks_per_transfer = blocks;
    }

    /// Report the media geometry, or `NoMedia` when no card has been
    /// brought up.
    pub fn media_parameters(&self) -> Result<MediaParameters, SdError> {
        let block_size = self.read_block_length.max(self.write_block_length);
        if block_size == 0 {
            return Err(SdError::NoMedia);
        }

        Ok(MediaParameters {
            block_count: self.user_capacity / self.read_block_length as u64,
            block_size,
        })
    }

    fn spi_mode(&self) -> bool {
        self.bus.host_capabilities.contains(Capabilities::SPI)
    }

    /// Bring the card from power-on to negotiated transfer state.
    ///
    /// Each step aborts the sequence on first failure and returns the
    /// triggering status; the context keeps whatever partial state it
    /// reached, and the caller decides whether to retry the sequence.
    pub fn initialize(&mut self, reset_controller: bool) -> Result<(), SdError> {
        if let Some(card_detect) = self.callbacks.card_detect {
            if !card_detect()? {
                log::info!("SD: no card present");
                return Ok(());
            }
        }

        if let Some(write_protect) = self.callbacks.write_protect {
            self.write_protected = write_protect()?;
            if self.write_protected {
                log::info!("SD: card is write protected");
            }
        }

        if reset_controller {
            self.host.reset(ResetFlags::ALL)?;
        }

        self.host
            .initialize(InitPhase::GatherCapabilities, &mut self.bus)?;

        self.max_blocks_per_transfer = MAX_BLOCK_COUNT;
        self.bus_width = 1;
        self.clock_speed = ClockSpeed::Clock400kHz;
        self.set_bus_parameters()?;
        self.host.initialize(InitPhase::ApplyPower, &mut self.bus)?;

        self.wait_for_card_to_initialize()?;

        if self.spi_mode() {
            self.set_crc(true)?;
        }

        let identification = self.card_identification()?;
        log::debug!(
            "SD: CID manufacturer {:#04x} product {} revision {:#04x}",
            identification.manufacturer_id,
            core::str::from_utf8(&identification.product_name).unwrap_or("?????"),
            identification.product_revision,
        );

        self.setup_addressing()?;
        self.read_card_specific_data()?;
        self.select_card()?;
        self.configure_erase_group()?;

        if self.is_sd_card() {
            self.set_sd_frequency()?;
        } else {
            self.set_mmc_frequency()?;
        }

        time::stall(10_000);

        // Clip the card's capabilities to the host's.
        self.card_capabilities &= self.bus.host_capabilities;
        if self.is_sd_card() {
            if self.card_capabilities.contains(Capabilities::BUS_4BIT) {
                self.bus_width = 4;
            }

            self.clock_speed = ClockSpeed::Clock25MHz;
            if self.card_capabilities.contains(Capabilities::HIGH_SPEED) {
                self.clock_speed = ClockSpeed::Clock50MHz;
            }

            self.set_bus_parameters()?;
        } else {
            self.negotiate_mmc_bus_width()?;
            if self
                .card_capabilities
                .contains(Capabilities::HIGH_SPEED_52MHZ)
            {
                self.clock_speed = ClockSpeed::Clock52MHz;
            } else if self.card_capabilities.contains(Capabilities::HIGH_SPEED) {
                self.clock_speed = ClockSpeed::Clock26MHz;
            }

            self.set_bus_parameters()?;
        }

        let mut result = Ok(());
        for _ in 0..SET_BLOCK_LENGTH_RETRY_COUNT {
            result = self.set_block_length(self.read_block_length);
            if result.is_ok() {
                break;
            }
        }

        result?;

        log::info!(
            "SD: initialized {} card: {} MB, bus width {}, clock {} Hz",
            if self.is_sd_card() { "SD" } else { "MMC" },
            self.user_capacity / (1024 * 1024),
            self.bus_width,
            self.clock_speed.hertz(),
        );

        Ok(())
    }

    /// Read whole blocks from the user area.
    ///
    /// The buffer length must be a multiple of the negotiated block
    /// length; the block count is derived from it.
    pub fn read_blocks(&mut self, block_offset: u64, buffer: &mut [u8]) -> Result<(), SdError> {
        let block_length = self.read_block_length as usize;
        if block_length == 0 {
            return Err(SdError::NotReady);
        }

        debug_assert_eq!(buffer.len() % block_length, 0);
        let block_count = buffer.len() / block_length;
        let mut blocks_done = 0;
        let mut attempts = 0;
        while blocks_done != block_count {
            let blocks_this_round =
                (block_count - blocks_done).min(self.max_blocks_per_transfer as usize);

            let start = blocks_done * block_length;
            let end = start + blocks_this_round * block_length;
            let result = self.read_blocks_polled(
                block_offset + blocks_done as u64,
                blocks_this_round as u32,
                &mut buffer[start..end],
            );

            match result {
                Ok(()) => blocks_done += blocks_this_round,
                Err(error) => {
                    if attempts >= IO_RETRIES {
                        return Err(error);
                    }

                    self.error_recovery()?;
                    attempts += 1;
                }
            }
        }

        Ok(())
    }

    /// Write whole blocks to the user area.
    ///
    /// The buffer length must be a multiple of the negotiated block
    /// length; the block count is derived from it.
    pub fn write_blocks(&mut self, block_offset: u64, buffer: &[u8]) -> Result<(), SdError> {
        let block_length = self.read_block_length as usize;
        if block_length == 0 {
            return Err(SdError::NotReady);
        }

        if self.write_protected {
            log::error!("SD: write attempted on a write-protected card");
            return Err(SdError::DeviceError);
        }

        debug_assert_eq!(buffer.len() % block_length, 0);
        let block_count = buffer.len() / block_length;
        let mut blocks_done = 0;
        let mut attempts = 0;
        while blocks_done != block_count {
            let blocks_this_round =
                (block_count - blocks_done).min(self.max_blocks_per_transfer as usize);

            let start = blocks_done * block_length;
            let end = start + blocks_this_round * block_length;
            let result = self.write_blocks_polled(
                block_offset + blocks_done as u64,
                blocks_this_round as u32,
                &buffer[start..end],
            );

            match result {
                Ok(()) => blocks_done += blocks_this_round,
                Err(error) => {
                    if attempts >= IO_RETRIES {
                        return Err(error);
                    }

                    self.error_recovery()?;
                    attempts += 1;
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // Initialization sequence
    // ========================================================================

    /// Program the card-side and controller-side bus width and clock.
    fn set_bus_parameters(&mut self) -> Result<(), SdError> {
        // If going wide, let the card know first.
        if self.bus_width != 1 {
            if self.is_sd_card() {
                let mut command = SdCommand::new(
                    SdOpcode::ApplicationSpecific,
                    ResponseType::R1,
                    (self.card_address as u32) << 16,
                );

                self.host.send_command(&mut command)?;

                // ACMD6 value 2 selects the 4-bit bus.
                let mut command = SdCommand::new(SdOpcode::Switch, ResponseType::R1, 2);
                self.host.send_command(&mut command)?;
            } else {
                let encoded = match self.bus_width {
                    8 => card::EXTENDED_CARD_DATA_BUS_WIDTH_8,
                    4 => card::EXTENDED_CARD_DATA_BUS_WIDTH_4,
                    _ => card::EXTENDED_CARD_DATA_BUS_WIDTH_1,
                };

                self.mmc_switch(card::EXTENDED_CARD_DATA_BUS_WIDTH as u8, encoded)?;
            }

            time::stall(2_000);
        }

        self.host.set_bus_width(self.bus_width)?;
        self.host.set_clock_speed(self.clock_speed.hertz())?;
        Ok(())
    }

    /// Send a reset (CMD0) to the card, with the stalls it needs around
    /// it.
    fn reset_card(&mut self) -> Result<(), SdError> {
        time::stall(CARD_DELAY_US);
        let mut command = SdCommand::new(SdOpcode::GoIdleState, ResponseType::NONE, 0);
        self.host.send_command(&mut command)?;
        time::stall(POST_RESET_DELAY_US);
        Ok(())
    }

    /// Probe the interface condition (CMD8).
    ///
    /// An echo of the check pattern means the card speaks version 2 or
    /// later; a mangled echo downgrades to 1.0. Cards predating the
    /// command fail every attempt, which the caller tolerates.
    fn interface_condition(&mut self) -> Result<(), SdError> {
        let mut result = Err(SdError::DeviceError);
        for _ in 0..INTERFACE_CONDITION_RETRY_COUNT {
            let mut command = SdCommand::new(
                SdOpcode::SendInterfaceCondition,
                ResponseType::R7,
                INTERFACE_CONDITION_ARGUMENT,
            );

            result = self.host.send_command(&mut command);
            time::stall(50);
            if result.is_ok() {
                if command.response[0] & 0xFF == INTERFACE_CONDITION_ARGUMENT & 0xFF {
                    self.version = SdVersion::Sd2;
                } else {
                    self.version = SdVersion::Sd1p0;
                }

                break;
            }
        }

        result
    }

    /// Negotiate the operating conditions with ACMD41 until the card
    /// reports not busy.
    ///
    /// The first iteration reads the operating-condition register; later
    /// iterations program the voltage window, requesting high capacity
    /// when the card negotiated version 2. A CMD55 failure means this is
    /// not an SD card at all and control moves to the MMC sequence.
    fn wait_for_card_to_initialize(&mut self) -> Result<(), SdError> {
        let mut ready_response = None;
        for _ in 0..CARD_INITIALIZE_RETRY_COUNT {
            self.reset_card()?;

            // Tolerated: older cards never answer CMD8.
            let _ = self.interface_condition();

            let mut operating_conditions = 0;
            let mut response = 0;
            for retry in 0..OPERATING_CONDITION_RETRY_COUNT {
                let mut command =
                    SdCommand::new(SdOpcode::ApplicationSpecific, ResponseType::R1, 0);

                if self.host.send_command(&mut command).is_err() {
                    // The card didn't like CMD55. This might be an MMC
                    // card; try the old fashioned CMD1.
                    return self.wait_for_mmc_card_to_initialize();
                }

                let mut argument = operating_conditions;
                if retry != 0 {
                    if !self.spi_mode() {
                        argument &= (self.bus.voltages.bits() & OCR_VOLTAGE_MASK)
                            | OCR_ACCESS_MODE;
                    }

                    if self.version == SdVersion::Sd2 {
                        argument |= OCR_HIGH_CAPACITY;
                    }
                }

                let mut command = SdCommand::new(
                    SdOpcode::SendSdOperatingCondition,
                    ResponseType::R3,
                    argument,
                );

                self.host.send_command(&mut command)?;
                time::stall(CARD_DELAY_US);
                response = command.response[0];
                if response & self.bus.voltages.bits() == 0 {
                    return Err(SdError::Unsupported);
                }

                // The first iteration just reads the register back.
                if retry == 0 {
                    operating_conditions = response;
                }

                if response & OCR_BUSY != 0 {
                    break;
                }
            }

            if response & OCR_BUSY != 0 {
                ready_response = Some(response);
                break;
            }
        }

        let Some(mut response) = ready_response else {
            return Err(SdError::NotReady);
        };

        if self.spi_mode() {
            let mut command =
                SdCommand::new(SdOpcode::SpiReadOperatingCondition, ResponseType::R3, 0);

            self.host.send_command(&mut command)?;
            response = command.response[0];
        }

        self.high_capacity = response & OCR_HIGH_CAPACITY != 0;
        log::debug!(
            "SD: card ready, operating conditions {:#010x}",
            response
        );

        Ok(())
    }

    /// Negotiate the operating conditions of an MMC card with CMD1.
    fn wait_for_mmc_card_to_initialize(&mut self) -> Result<(), SdError> {
        // Some eMMC parts wedge the next command without a settle delay
        // here.
        time::stall(CARD_DELAY_US);
        let mut operating_conditions = 0;
        let mut retry = 0;
        while retry < OPERATING_CONDITION_RETRY_COUNT {
            let mut command = SdCommand::new(
                SdOpcode::SendMmcOperatingCondition,
                ResponseType::R3,
                operating_conditions,
            );

            // A backend that captures no R3 response must look ready
            // rather than wedging the loop.
            command.response[0] = 0xFFFF_FFFF;
            self.host.send_command(&mut command)?;
            if operating_conditions == 0 {
                // The register has never been programmed. Program it now
                // and run the whole exchange again.
                operating_conditions = command.response[0];
                operating_conditions &=
                    (self.bus.voltages.bits() & OCR_VOLTAGE_MASK) | OCR_ACCESS_MODE;

                operating_conditions |= OCR_HIGH_CAPACITY;
                self.reset_card()?;
            } else if command.response[0] & OCR_BUSY != 0 {
                self.version = SdVersion::Mmc3;
                if command.response[0] & OCR_HIGH_CAPACITY != 0 {
                    self.high_capacity = true;
                }

                log::debug!(
                    "SD: MMC card ready, operating conditions {:#010x}",
                    command.response[0]
                );

                return Ok(());
            } else {
                retry += 1;
            }

            time::stall(CARD_DELAY_US);
        }

        Err(SdError::NotReady)
    }

    /// Enable or disable CRC protection (SPI mode only).
    fn set_crc(&mut self, enable: bool) -> Result<(), SdError> {
        let mut command =
            SdCommand::new(SdOpcode::SpiCrcOnOff, ResponseType::R1, enable as u32);

        self.host.send_command(&mut command)
    }

    /// Read the card identification structure.
    fn card_identification(&mut self) -> Result<CardIdentification, SdError> {
        let opcode = if self.spi_mode() {
            SdOpcode::SendCardIdentification
        } else {
            SdOpcode::AllSendCardIdentification
        };

        let mut command = SdCommand::new(opcode, ResponseType::R2, 0);
        self.host.send_command(&mut command)?;
        Ok(CardIdentification::from_response(&command.response))
    }

    /// Assign or read the relative card address.
    fn setup_addressing(&mut self) -> Result<(), SdError> {
        // Addressing does not exist in SPI mode.
        if self.spi_mode() {
            return Ok(());
        }

        let mut command = SdCommand::new(
            SdOpcode::SetRelativeAddress,
            ResponseType::R6,
            (self.card_address as u32) << 16,
        );

        self.host.send_command(&mut command)?;
        if self.is_sd_card() {
            self.card_address = (command.response[0] >> 16) as u16;
        }

        Ok(())
    }

    /// Read and decode the card-specific data.
    fn read_card_specific_data(&mut self) -> Result<(), SdError> {
        let mut command = SdCommand::new(
            SdOpcode::SendCardSpecificData,
            ResponseType::R2,
            (self.card_address as u32) << 16,
        );

        self.host.send_command(&mut command)?;
        self.wait_for_state_transition()?;

        let decoded = card::decode_csd(&command.response, self.version, self.high_capacity);
        self.version = decoded.version;

        // SD negotiation replaces this completely; MMC negotiation may.
        self.clock_speed = decoded.clock_speed;
        self.read_block_length = decoded.read_block_length;
        self.write_block_length = decoded.write_block_length;
        self.user_capacity = decoded.user_capacity;
        self.card_specific_data = command.response;
        Ok(())
    }

    /// Move the card to the transfer state.
    fn select_card(&mut self) -> Result<(), SdError> {
        // Selection does not exist in SPI mode.
        if self.spi_mode() {
            return Ok(());
        }

        let mut command = SdCommand::new(
            SdOpcode::SelectCard,
            ResponseType::R1,
            (self.card_address as u32) << 16,
        );

        self.host.send_command(&mut command)?;
        self.wait_for_state_transition()
    }

    /// Record erase-group geometry and partition capacities.
    fn configure_erase_group(&mut self) -> Result<(), SdError> {
        // For SD the erase group is always one sector.
        self.erase_group_size = 1;
        self.partition_configuration = card::PARTITION_NONE;
        if self.is_sd_card() || self.version < SdVersion::Mmc4 {
            return Ok(());
        }

        let data = self.extended_card_data()?;
        if data.revision() >= 2 {
            // The sector count is authoritative above 2GB.
            let capacity = data.sector_count() * MAX_BLOCK_SIZE as u64;
            if capacity > card::EXTENDED_SECTOR_COUNT_MINIMUM {
                self.user_capacity = capacity;
            }
        }

        match data.revision() {
            1 => self.version = SdVersion::Mmc4p1,
            2 => self.version = SdVersion::Mmc4p2,
            3 => self.version = SdVersion::Mmc4p3,
            5 => self.version = SdVersion::Mmc4p41,
            6 => self.version = SdVersion::Mmc4p5,
            _ => {}
        }

        // A partitioned device needs the erase-group-def bit turned on
        // after every reset or power cycle.
        if data.partitioning_support() & card::PARTITION_SUPPORT != 0
            && data.partitions_attribute() & card::PARTITION_ENHANCED_ATTRIBUTE != 0
        {
            self.mmc_switch(card::EXTENDED_CARD_DATA_ERASE_GROUP_DEF as u8, 1)?;
            self.erase_group_size =
                data.erase_group_size() as u32 * MAX_BLOCK_SIZE as u32 * 1024;
        } else {
            let erase_group_size = (self.card_specific_data[2]
                & card::CSD2_ERASE_GROUP_SIZE_MASK)
                >> card::CSD2_ERASE_GROUP_SIZE_SHIFT;

            let erase_group_multiplier = (self.card_specific_data[2]
                & card::CSD2_ERASE_GROUP_MULTIPLIER_MASK)
                >> card::CSD2_ERASE_GROUP_MULTIPLIER_SHIFT;

            self.erase_group_size = (erase_group_size + 1) * (erase_group_multiplier + 1);
        }

        if data.partitioning_support() & card::PARTITION_SUPPORT != 0 || data.boot_size() != 0 {
            self.partition_configuration = data.partition_configuration();
        }

        self.boot_capacity =
            (data.boot_size() as u64) << card::EXTENDED_CARD_DATA_PARTITION_SHIFT;

        self.rpmb_capacity =
            (data.rpmb_size() as u64) << card::EXTENDED_CARD_DATA_PARTITION_SHIFT;

        for partition in 0..GENERAL_PARTITION_COUNT {
            self.general_partition_capacity[partition] = data.general_partition_size(partition)
                * data.erase_group_size() as u64
                * data.write_protect_group_size() as u64;
        }

        Ok(())
    }

    /// Read the extended card-specific data (MMC).
    fn extended_card_data(&mut self) -> Result<ExtendedCardData, SdError> {
        let mut data = [0u8; MAX_BLOCK_SIZE];
        let mut command =
            SdCommand::new(SdOpcode::SendInterfaceCondition, ResponseType::R1, 0)
                .with_read(&mut data);

        self.host.send_command(&mut command)?;
        drop(command);
        Ok(ExtendedCardData(data))
    }

    /// Write one byte of the extended card-specific data (MMC CMD6).
    fn mmc_switch(&mut self, index: u8, value: u8) -> Result<(), SdError> {
        const SWITCH_MODE_WRITE_BYTE: u32 = 0x03;
        const SWITCH_MODE_SHIFT: u32 = 24;
        const SWITCH_INDEX_SHIFT: u32 = 16;
        const SWITCH_VALUE_SHIFT: u32 = 8;

        let argument = (SWITCH_MODE_WRITE_BYTE << SWITCH_MODE_SHIFT)
            | ((index as u32) << SWITCH_INDEX_SHIFT)
            | ((value as u32) << SWITCH_VALUE_SHIFT);

        let mut command = SdCommand::new(SdOpcode::Switch, ResponseType::R1B, argument);
        self.host.send_command(&mut command)?;
        self.wait_for_state_transition()
    }

    /// Run the SD switch-function command, filling the 64-byte status.
    fn sd_switch(
        &mut self,
        mode: u32,
        group: u32,
        value: u8,
        status: &mut [u8; 64],
    ) -> Result<(), SdError> {
        let mut argument = (mode << 31) | 0x00FF_FFFF;
        argument &= !(0xF << (group * 4));
        argument |= (value as u32) << (group * 4);

        let mut command = SdCommand::new(SdOpcode::Switch, ResponseType::R1, argument)
            .with_read(status.as_mut_slice());

        self.host.send_command(&mut command)
    }

    /// Poll card status until it is ready for data and out of the
    /// program state.
    fn wait_for_state_transition(&mut self) -> Result<(), SdError> {
        let argument = if self.spi_mode() {
            0
        } else {
            (self.card_address as u32) << 16
        };

        let mut timeout = Timeout::from_us(STATUS_TIMEOUT_US);
        loop {
            let mut command = SdCommand::new(SdOpcode::SendStatus, ResponseType::R1, argument);
            if self.host.send_command(&mut command).is_ok() {
                let status = command.response[0];
                if status & CARD_STATUS_READY_FOR_DATA != 0
                    && status & CARD_STATUS_CURRENT_STATE != CARD_STATUS_STATE_PROGRAM
                {
                    return Ok(());
                }

                if status & CARD_STATUS_ERROR_MASK != 0 {
                    return Err(SdError::DeviceError);
                }
            }

            if timeout.stall_and_check() {
                return Err(SdError::Timeout);
            }
        }
    }

    /// Read the card status register.
    fn card_status(&mut self) -> Result<u32, SdError> {
        let argument = if self.spi_mode() {
            0
        } else {
            (self.card_address as u32) << 16
        };

        let mut command = SdCommand::new(SdOpcode::SendStatus, ResponseType::R1, argument);
        self.host.send_command(&mut command)?;
        Ok(command.response[0])
    }

    /// Learn the SD card's speed capabilities and switch it to high
    /// speed when card, protocol, and host all agree.
    fn set_sd_frequency(&mut self) -> Result<(), SdError> {
        self.card_capabilities = Capabilities::empty();
        if self.spi_mode() {
            return Ok(());
        }

        // The configuration register says whether the card supports
        // higher speeds at all.
        let mut command = SdCommand::new(
            SdOpcode::ApplicationSpecific,
            ResponseType::R1,
            (self.card_address as u32) << 16,
        );

        self.host.send_command(&mut command)?;

        let mut configuration = [0u8; 8];
        let mut retries = CONFIGURATION_REGISTER_RETRY_COUNT;
        loop {
            time::stall(50_000);
            let mut command = SdCommand::new(
                SdOpcode::SendSdConfigurationRegister,
                ResponseType::R1,
                0,
            )
            .with_read(&mut configuration);

            match self.host.send_command(&mut command) {
                Ok(()) => break,
                Err(error) => {
                    if retries == 0 {
                        return Err(error);
                    }

                    retries -= 1;
                }
            }
        }

        let (version, four_bit) =
            card::decode_configuration_register(card::status_word(&configuration, 0));

        self.version = version;
        if four_bit {
            self.card_capabilities |= Capabilities::BUS_4BIT;
        }

        // Version 1.0 doesn't support switching, so end now.
        if self.version == SdVersion::Sd1p0 {
            return Ok(());
        }

        let mut status = [0u8; 64];
        let mut retries = SWITCH_RETRY_COUNT;
        while retries != 0 {
            retries -= 1;
            self.sd_switch(card::SWITCH_CHECK, 0, 1, &mut status)?;

            // Wait for the high-speed function to come out of busy.
            if card::status_word(&status, 7) & card::SWITCH_STATUS_7_HIGH_SPEED_BUSY == 0 {
                break;
            }
        }

        // Nothing further to do if high speed isn't supported by the
        // card or the host.
        if card::status_word(&status, 3) & card::SWITCH_STATUS_3_HIGH_SPEED_SUPPORTED == 0 {
            return Ok(());
        }

        if !self
            .bus
            .host_capabilities
            .intersects(Capabilities::HIGH_SPEED | Capabilities::HIGH_SPEED_52MHZ)
        {
            return Ok(());
        }

        self.sd_switch(card::SWITCH_SWITCH, 0, 1, &mut status)?;
        if card::status_word(&status, 4) & card::SWITCH_STATUS_4_HIGH_SPEED_MASK
            == card::SWITCH_STATUS_4_HIGH_SPEED_VALUE
        {
            self.card_capabilities |= Capabilities::HIGH_SPEED;
        }

        Ok(())
    }

    /// Learn the MMC card's speed capabilities and request high speed,
    /// confirming that the switch stuck.
    fn set_mmc_frequency(&mut self) -> Result<(), SdError> {
        self.card_capabilities = Capabilities::empty();
        if self.spi_mode() {
            return Ok(());
        }

        // Only version 4 supports high speed.
        if self.version < SdVersion::Mmc4 {
            return Ok(());
        }

        let data = self.extended_card_data()?;
        let card_type = data.card_type();
        self.mmc_switch(card::EXTENDED_CARD_DATA_HIGH_SPEED as u8, 1)?;

        // Read the extended data again to see if the bit stuck.
        let data = self.extended_card_data()?;
        if data.high_speed() == 0 {
            return Ok(());
        }

        self.card_capabilities |= Capabilities::HIGH_SPEED;
        if card_type & card::CARD_TYPE_HIGH_SPEED_52MHZ != 0 {
            self.card_capabilities |= Capabilities::HIGH_SPEED_52MHZ;
        }

        Ok(())
    }

    /// Probe MMC bus widths widest-first, keeping the first one the card
    /// acknowledges.
    fn negotiate_mmc_bus_width(&mut self) -> Result<(), SdError> {
        let mut result = Err(SdError::Unsupported);
        for (width, encoded) in [
            (8, card::EXTENDED_CARD_DATA_BUS_WIDTH_8),
            (4, card::EXTENDED_CARD_DATA_BUS_WIDTH_4),
            (1, card::EXTENDED_CARD_DATA_BUS_WIDTH_1),
        ] {
            match width {
                8 if !self.bus.host_capabilities.contains(Capabilities::BUS_8BIT) => continue,
                4 if !self.bus.host_capabilities.contains(Capabilities::BUS_4BIT) => continue,
                _ => {}
            }

            if self
                .mmc_switch(card::EXTENDED_CARD_DATA_BUS_WIDTH as u8, encoded)
                .is_err()
            {
                continue;
            }

            self.bus_width = width;
            self.set_bus_parameters()?;

            // The width is good if the card still answers a data
            // transfer over it.
            if self.extended_card_data().is_ok() {
                match width {
                    8 => self.card_capabilities |= Capabilities::BUS_8BIT,
                    4 => self.card_capabilities |= Capabilities::BUS_4BIT,
                    _ => {}
                }

                result = Ok(());
                break;
            }
        }

        result
    }

    /// Program the card's block length (CMD16).
    fn set_block_length(&mut self, block_length: u32) -> Result<(), SdError> {
        let mut command =
            SdCommand::new(SdOpcode::SetBlockLength, ResponseType::R1, block_length);

        self.host.send_command(&mut command)
    }

    // ========================================================================
    // Block I/O
    // ========================================================================

    /// Issue one polled read command for a bounded chunk.
    fn read_blocks_polled(
        &mut self,
        block_offset: u64,
        block_count: u32,
        buffer: &mut [u8],
    ) -> Result<(), SdError> {
        let opcode = if block_count > 1 {
            SdOpcode::ReadMultipleBlocks
        } else {
            SdOpcode::ReadSingleBlock
        };

        let argument = if self.high_capacity {
            block_offset as u32
        } else {
            (block_offset * self.read_block_length as u64) as u32
        };

        let mut command =
            SdCommand::new(opcode, ResponseType::R1, argument).with_read(buffer);

        self.host.send_command(&mut command)?;
        drop(command);

        if block_count > 1
            && !self
                .bus
                .host_capabilities
                .contains(Capabilities::AUTO_CMD12)
        {
            let mut stop = SdCommand::new(SdOpcode::StopTransmission, ResponseType::R1B, 0);
            self.host.send_command(&mut stop)?;
        }

        Ok(())
    }

    /// Issue one polled write command for a bounded chunk.
    fn write_blocks_polled(
        &mut self,
        block_offset: u64,
        block_count: u32,
        buffer: &[u8],
    ) -> Result<(), SdError> {
        let opcode = if block_count > 1 {
            SdOpcode::WriteMultipleBlocks
        } else {
            SdOpcode::WriteSingleBlock
        };

        let argument = if self.high_capacity {
            block_offset as u32
        } else {
            (block_offset * self.read_block_length as u64) as u32
        };

        let mut command =
            SdCommand::new(opcode, ResponseType::R1, argument).with_write(buffer);

        self.host.send_command(&mut command)?;
        drop(command);

        // SPI multiblock writes terminate with a token instead of CMD12,
        // and a controller doing auto CMD12 sends its own.
        if block_count > 1
            && !self
                .bus
                .host_capabilities
                .intersects(Capabilities::SPI | Capabilities::AUTO_CMD12)
        {
            let mut stop = SdCommand::new(SdOpcode::StopTransmission, ResponseType::R1B, 0);
            self.host.send_command(&mut stop)?;
        }

        Ok(())
    }

    /// Recover from a failed transfer: abort, reset the lines, and run
    /// the initialization sequence again without a hardware reset.
    fn error_recovery(&mut self) -> Result<(), SdError> {
        if let Err(error) = self.asynchronous_abort() {
            log::error!("SD: abort failed: {:?}", error);
        }

        let result = self.initialize(false);
        if let Err(error) = result {
            log::error!("SD: reinitialize failed: {:?}", error);
        }

        result
    }

    /// Abort the current operation and wait for the card to return to
    /// the transfer state.
    fn asynchronous_abort(&mut self) -> Result<(), SdError> {
        let mut timeout = Timeout::from_us(STATUS_TIMEOUT_US);
        loop {
            let mut command =
                SdCommand::new(SdOpcode::StopTransmission, ResponseType::NONE, 0);

            self.host.send_command(&mut command)?;
            self.host
                .reset(ResetFlags::COMMAND_LINE | ResetFlags::DATA_LINE)?;

            let status = self.card_status()?;
            if status & CARD_STATUS_READY_FOR_DATA != 0
                && status & CARD_STATUS_CURRENT_STATE == CARD_STATUS_STATE_TRANSFER
            {
                return Ok(());
            }

            if timeout.stall_and_check() {
                return Err(SdError::Timeout);
            }
        }
    }
}
