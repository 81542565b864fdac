//! Standard SD host controller backend.
//!
//! Implements the five-operation host interface against the standard
//! host-controller register layout. Transfers use the polled
//! word-at-a-time FIFO path through the buffer data port; there is no DMA
//! and no interrupt signaling.

pub mod regs;

use core::ptr;

use crate::command::{DataTransfer, ResponseType, SdCommand, SdOpcode};
use crate::error::SdError;
use crate::host::{BusParameters, Capabilities, InitPhase, ResetFlags, SdHost, Voltages};
use crate::time::Timeout;

use regs::*;

/// Block unit for FIFO batches and block-count programming.
const BLOCK_SIZE: usize = 512;

/// Budget for any single register poll, in microseconds.
const REGISTER_TIMEOUT_US: u64 = 1_000_000;

/// Raw register access for a standard host controller.
///
/// Production code maps this directly onto the memory-mapped register
/// block; tests substitute a simulated register file.
pub trait RegisterBus {
    /// Read the 32-bit register.
    fn read_register(&mut self, register: SdRegister) -> u32;

    /// Write the 32-bit register.
    fn write_register(&mut self, register: SdRegister, value: u32);
}

/// Memory-mapped register block at a fixed base address.
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// Wrap the register block at the given physical base address.
    pub fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterBus for MmioRegisters {
    fn read_register(&mut self, register: SdRegister) -> u32 {
        unsafe { ptr::read_volatile((self.base + register.offset()) as *const u32) }
    }

    fn write_register(&mut self, register: SdRegister, value: u32) {
        unsafe { ptr::write_volatile((self.base + register.offset()) as *mut u32, value) }
    }
}

// Safety: the register block belongs to exactly one controller context,
// which is never shared between execution contexts.
unsafe impl Send for MmioRegisters {}

/// The standard host-controller backend over MMIO registers.
pub type StandardSdHost = StandardHost<MmioRegisters>;

/// Standard host controller backend state.
pub struct StandardHost<B: RegisterBus> {
    regs: B,
    host_version: u32,
    fundamental_clock: u32,
    capabilities: Capabilities,
}

impl<B: RegisterBus> StandardHost<B> {
    /// Create a backend over the given register bus.
    pub fn new(regs: B) -> Self {
        Self {
            regs,
            host_version: 0,
            fundamental_clock: 0,
            capabilities: Capabilities::empty(),
        }
    }

    /// Poll the interrupt status register until any bit is set.
    fn wait_for_interrupt(&mut self) -> Result<u32, SdError> {
        let mut timeout = Timeout::from_us(REGISTER_TIMEOUT_US);
        loop {
            let status = self.regs.read_register(SdRegister::InterruptStatus);
            if status != 0 {
                return Ok(status);
            }

            if timeout.stall_and_check() {
                return Err(SdError::Timeout);
            }
        }
    }

    /// Drain one polled read transfer through the buffer data port.
    fn read_data(&mut self, data: &mut [u8]) -> Result<(), SdError> {
        let batch_words = data.len().min(BLOCK_SIZE) / 4;
        let mut offset = 0;
        while offset < data.len() {
            let status = self.wait_for_interrupt()?;
            if status & INT_STATUS_DATA_ERROR_MASK != 0 {
                self.reset(ResetFlags::DATA_LINE)?;
            }

            if status & INT_STATUS_ERROR_INTERRUPT != 0 {
                log::debug!("SDHCI: data error on read: status {:#010x}", status);
                return Err(SdError::DeviceError);
            }

            if status & INT_STATUS_BUFFER_READ_READY != 0 {
                // Acknowledge this batch of interrupts.
                self.regs
                    .write_register(SdRegister::InterruptStatus, status);

                for _ in 0..batch_words {
                    let word = self.regs.read_register(SdRegister::BufferDataPort);
                    data[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
                    offset += 4;
                }
            }
        }

        // Acknowledge any trailing completion bits.
        let status = self.regs.read_register(SdRegister::InterruptStatus);
        if status & (INT_STATUS_BUFFER_WRITE_READY | INT_STATUS_TRANSFER_COMPLETE) != 0 {
            self.regs
                .write_register(SdRegister::InterruptStatus, status);
        }

        Ok(())
    }

    /// Feed one polled write transfer through the buffer data port.
    fn write_data(&mut self, data: &[u8]) -> Result<(), SdError> {
        let batch_words = data.len().min(BLOCK_SIZE) / 4;
        let mut offset = 0;
        while offset < data.len() {
            let status = self.wait_for_interrupt()?;
            if status & INT_STATUS_DATA_ERROR_MASK != 0 {
                self.reset(ResetFlags::DATA_LINE)?;
            }

            if status & INT_STATUS_ERROR_INTERRUPT != 0 {
                log::debug!("SDHCI: data error on write: status {:#010x}", status);
                return Err(SdError::DeviceError);
            }

            if status & INT_STATUS_BUFFER_WRITE_READY != 0 {
                self.regs
                    .write_register(SdRegister::InterruptStatus, status);

                for _ in 0..batch_words {
                    let word = u32::from_le_bytes([
                        data[offset],
                        data[offset + 1],
                        data[offset + 2],
                        data[offset + 3],
                    ]);

                    self.regs.write_register(SdRegister::BufferDataPort, word);
                    offset += 4;
                }
            }
        }

        let status = self.regs.read_register(SdRegister::InterruptStatus);
        if status & (INT_STATUS_BUFFER_READ_READY | INT_STATUS_TRANSFER_COMPLETE) != 0 {
            self.regs
                .write_register(SdRegister::InterruptStatus, status);
        }

        Ok(())
    }
}

/// Find the clock divisor for the requested speed.
///
/// Pre-version-3 controllers divide by powers of two; version 3 divides by
/// any even number, so the search walks even steps for exact granularity.
fn compute_divisor(host_version: u32, fundamental_clock: u32, clock_speed: u32) -> u32 {
    if host_version < HOST_VERSION_3 {
        let mut divisor = 1;
        let mut result = fundamental_clock;
        while divisor < V2_MAX_DIVISOR {
            if result <= clock_speed {
                break;
            }

            divisor <<= 1;
            result >>= 1;
        }

        divisor
    } else if clock_speed >= fundamental_clock {
        0
    } else {
        let mut divisor = 2;
        while divisor < V3_MAX_DIVISOR {
            if fundamental_clock / divisor <= clock_speed {
                break;
            }

            divisor += 2;
        }

        divisor
    }
}

impl<B: RegisterBus> SdHost for StandardHost<B> {
    fn initialize(&mut self, phase: InitPhase, bus: &mut BusParameters) -> Result<(), SdError> {
        match phase {
            InitPhase::GatherCapabilities => {
                let value = self.regs.read_register(SdRegister::SlotStatusVersion) >> 16;
                self.host_version = value & HOST_VERSION_MASK;

                let capabilities = self.regs.read_register(SdRegister::Capabilities);
                if capabilities & CAPABILITY_ADMA2 != 0 {
                    bus.host_capabilities |= Capabilities::ADMA2;
                }

                if capabilities & CAPABILITY_HIGH_SPEED != 0 {
                    bus.host_capabilities |=
                        Capabilities::HIGH_SPEED | Capabilities::HIGH_SPEED_52MHZ;
                }

                // Derive the voltage windows if the caller did not supply
                // any.
                if bus.voltages.is_empty() {
                    if capabilities & CAPABILITY_VOLTAGE_1V8 != 0 {
                        bus.voltages |= Voltages::V165_195;
                    }

                    if capabilities & CAPABILITY_VOLTAGE_3V0 != 0 {
                        bus.voltages |= Voltages::V29_30 | Voltages::V30_31;
                    }

                    if capabilities & CAPABILITY_VOLTAGE_3V3 != 0 {
                        bus.voltages |= Voltages::V32_33 | Voltages::V33_34;
                    }
                }

                if bus.voltages.is_empty() {
                    return Err(SdError::NotReady);
                }

                // Pick the bus power level from the voltage windows. Some
                // controllers have no capabilities register, so the
                // windows are the authority here.
                let power = if bus
                    .voltages
                    .contains(Voltages::V32_33 | Voltages::V33_34)
                {
                    HOST_CONTROL_POWER_3V3
                } else if bus.voltages.contains(Voltages::V29_30 | Voltages::V30_31) {
                    HOST_CONTROL_POWER_3V0
                } else if bus.voltages.intersects(Voltages::V165_195) {
                    HOST_CONTROL_POWER_1V8
                } else {
                    return Err(SdError::NotReady);
                };

                self.regs.write_register(SdRegister::HostControl, power);

                // Derive the base clock if the caller did not supply one.
                // The field widened in controller version 3.
                if bus.fundamental_clock == 0 {
                    let field = capabilities >> CAPABILITY_BASE_CLOCK_FREQUENCY_SHIFT;
                    let megahertz = if self.host_version >= HOST_VERSION_3 {
                        field & CAPABILITY_V3_BASE_CLOCK_FREQUENCY_MASK
                    } else {
                        field & CAPABILITY_BASE_CLOCK_FREQUENCY_MASK
                    };

                    bus.fundamental_clock = megahertz * 1_000_000;
                }

                if bus.fundamental_clock == 0 {
                    return Err(SdError::NotReady);
                }

                self.fundamental_clock = bus.fundamental_clock;
                self.capabilities = bus.host_capabilities;
            }

            InitPhase::ApplyPower => {
                let value = self.regs.read_register(SdRegister::HostControl);
                self.regs
                    .write_register(SdRegister::HostControl, value | HOST_CONTROL_POWER_ENABLE);

                self.regs.write_register(
                    SdRegister::InterruptStatusEnable,
                    INT_STATUS_ENABLE_DEFAULT_MASK,
                );

                // Polled operation only.
                self.regs
                    .write_register(SdRegister::InterruptSignalEnable, 0);
            }
        }

        Ok(())
    }

    fn reset(&mut self, flags: ResetFlags) -> Result<(), SdError> {
        let mut reset_bits = 0;
        if flags.contains(ResetFlags::ALL) {
            reset_bits |= CLOCK_CONTROL_RESET_ALL;
        }

        if flags.contains(ResetFlags::COMMAND_LINE) {
            reset_bits |= CLOCK_CONTROL_RESET_COMMAND_LINE;
        }

        if flags.contains(ResetFlags::DATA_LINE) {
            reset_bits |= CLOCK_CONTROL_RESET_DATA_LINE;
        }

        let value = self.regs.read_register(SdRegister::ClockControl);
        self.regs
            .write_register(SdRegister::ClockControl, value | reset_bits);

        let mut timeout = Timeout::from_us(REGISTER_TIMEOUT_US);
        let mut result = Err(SdError::Timeout);
        loop {
            if self.regs.read_register(SdRegister::ClockControl) & reset_bits == 0 {
                result = Ok(());
                break;
            }

            if timeout.stall_and_check() {
                break;
            }
        }

        // Clear stale status and re-arm the status-enable mask.
        self.regs
            .write_register(SdRegister::InterruptStatus, INT_STATUS_ALL_MASK);

        self.regs.write_register(
            SdRegister::InterruptStatusEnable,
            INT_STATUS_ENABLE_DEFAULT_MASK,
        );

        result
    }

    fn send_command(&mut self, command: &mut SdCommand<'_>) -> Result<(), SdError> {
        // A non-busy stop transmission may be sent while the data lines
        // are still active, so skip the data inhibit check for it.
        let inhibit_mask = if command.opcode == SdOpcode::StopTransmission
            && !command.response_type.contains(ResponseType::BUSY)
        {
            STATE_COMMAND_INHIBIT
        } else {
            STATE_COMMAND_INHIBIT | STATE_DATA_INHIBIT
        };

        let mut timeout = Timeout::from_us(REGISTER_TIMEOUT_US);
        loop {
            let state = self.regs.read_register(SdRegister::PresentState);
            if state & inhibit_mask == 0 {
                break;
            }

            if timeout.stall_and_check() {
                log::debug!("SDHCI: command or data inhibited: {:#010x}", state);
                return Err(SdError::Timeout);
            }
        }

        // Clear interrupts from the previous command before proceeding.
        self.regs
            .write_register(SdRegister::InterruptStatus, INT_STATUS_ALL_MASK);

        let mut flags = 0;
        if command.response_type.contains(ResponseType::PRESENT) {
            if command.response_type.contains(ResponseType::LENGTH_136) {
                flags |= COMMAND_RESPONSE_136;
            } else if command.response_type.contains(ResponseType::BUSY) {
                flags |= COMMAND_RESPONSE_48_BUSY;
            } else {
                flags |= COMMAND_RESPONSE_48;
            }
        }

        if command.response_type.contains(ResponseType::VALID_CRC) {
            flags |= COMMAND_CRC_CHECK_ENABLE;
        }

        if command.response_type.contains(ResponseType::OPCODE) {
            flags |= COMMAND_INDEX_CHECK_ENABLE;
        }

        let data_len = command.data_len();
        if data_len != 0 {
            if command.is_multiple_block() {
                flags |= COMMAND_MULTIPLE_BLOCKS | COMMAND_BLOCK_COUNT_ENABLE;
                let block_count = (data_len / BLOCK_SIZE) as u32;
                self.regs.write_register(
                    SdRegister::BlockSizeCount,
                    BLOCK_SIZE as u32
                        | SIZE_SDMA_BOUNDARY_512K
                        | (block_count << SIZE_BLOCK_COUNT_SHIFT),
                );

                if self.capabilities.contains(Capabilities::AUTO_CMD12) {
                    flags |= COMMAND_AUTO_COMMAND12_ENABLE;
                }
            } else {
                self.regs.write_register(
                    SdRegister::BlockSizeCount,
                    data_len as u32 | SIZE_SDMA_BOUNDARY_512K,
                );
            }

            flags |= COMMAND_DATA_PRESENT;
            flags |= match command.data {
                Some(DataTransfer::Write(_)) => COMMAND_TRANSFER_WRITE,
                _ => COMMAND_TRANSFER_READ,
            };
        }

        self.regs
            .write_register(SdRegister::Argument1, command.argument);

        self.regs.write_register(
            SdRegister::Command,
            ((command.opcode as u32) << COMMAND_INDEX_SHIFT) | flags,
        );

        let status = self.wait_for_interrupt()?;
        if status & INT_STATUS_COMMAND_TIMEOUT_ERROR != 0 {
            log::debug!("SDHCI: CMD{} timeout", command.opcode as u8);
            self.reset(ResetFlags::COMMAND_LINE)?;
            return Err(SdError::Timeout);
        }

        if status & INT_STATUS_ERROR_INTERRUPT != 0 {
            log::debug!(
                "SDHCI: CMD{} error: status {:#010x}",
                command.opcode as u8,
                status
            );

            return Err(SdError::DeviceError);
        }

        if status & INT_STATUS_COMMAND_COMPLETE != 0 {
            self.regs
                .write_register(SdRegister::InterruptStatus, INT_STATUS_COMMAND_COMPLETE);

            if command.response_type.contains(ResponseType::PRESENT) {
                if command.response_type.contains(ResponseType::LENGTH_136) {
                    command.response[3] = self.regs.read_register(SdRegister::Response10);
                    command.response[2] = self.regs.read_register(SdRegister::Response32);
                    command.response[1] = self.regs.read_register(SdRegister::Response54);
                    command.response[0] = self.regs.read_register(SdRegister::Response76);

                    // Some controllers drop the CRC byte from the
                    // response registers, leaving the words shifted right
                    // by eight bits.
                    if self
                        .capabilities
                        .contains(Capabilities::RESPONSE_136_SHIFTED)
                    {
                        command.response[0] = (command.response[0] << 8)
                            | ((command.response[1] >> 24) & 0xFF);

                        command.response[1] = (command.response[1] << 8)
                            | ((command.response[2] >> 24) & 0xFF);

                        command.response[2] = (command.response[2] << 8)
                            | ((command.response[3] >> 24) & 0xFF);

                        command.response[3] <<= 8;
                    }
                } else {
                    command.response[0] = self.regs.read_register(SdRegister::Response10);
                }
            }
        }

        match command.data.as_mut() {
            Some(DataTransfer::Read(buffer)) => self.read_data(buffer)?,
            Some(DataTransfer::Write(buffer)) => self.write_data(buffer)?,
            None => {}
        }

        Ok(())
    }

    fn bus_width(&mut self) -> Result<u32, SdError> {
        let value = self.regs.read_register(SdRegister::HostControl);
        if value & HOST_CONTROL_DATA_8BIT != 0 {
            Ok(8)
        } else if value & HOST_CONTROL_DATA_4BIT != 0 {
            Ok(4)
        } else {
            Ok(1)
        }
    }

    fn set_bus_width(&mut self, width: u32) -> Result<(), SdError> {
        let mut value = self.regs.read_register(SdRegister::HostControl);
        value &= !HOST_CONTROL_BUS_WIDTH_MASK;
        match width {
            1 => value |= HOST_CONTROL_DATA_1BIT,
            4 => value |= HOST_CONTROL_DATA_4BIT,
            8 => value |= HOST_CONTROL_DATA_8BIT,
            _ => {
                log::error!("SDHCI: invalid bus width {}", width);
                return Err(SdError::InvalidParameter);
            }
        }

        self.regs.write_register(SdRegister::HostControl, value);
        Ok(())
    }

    fn set_clock_speed(&mut self, hertz: u32) -> Result<(), SdError> {
        let divisor = compute_divisor(self.host_version, self.fundamental_clock, hertz);
        let encoded = divisor >> 1;

        let mut clock_control = CLOCK_CONTROL_DEFAULT_TIMEOUT << CLOCK_CONTROL_TIMEOUT_SHIFT;
        self.regs
            .write_register(SdRegister::ClockControl, clock_control);

        clock_control |= (encoded & CLOCK_CONTROL_DIVISOR_MASK) << CLOCK_CONTROL_DIVISOR_SHIFT;
        clock_control |=
            (encoded & CLOCK_CONTROL_DIVISOR_HIGH_MASK) >> CLOCK_CONTROL_DIVISOR_HIGH_SHIFT;

        clock_control |= CLOCK_CONTROL_INTERNAL_CLOCK_ENABLE;

        // Some controllers latch the divisor only on a second write.
        self.regs
            .write_register(SdRegister::ClockControl, clock_control);

        self.regs
            .write_register(SdRegister::ClockControl, clock_control);

        let mut timeout = Timeout::from_us(REGISTER_TIMEOUT_US);
        loop {
            let value = self.regs.read_register(SdRegister::ClockControl);
            if value & CLOCK_CONTROL_CLOCK_STABLE != 0 {
                break;
            }

            if timeout.stall_and_check() {
                log::error!("SDHCI: internal clock not stable");
                return Err(SdError::Timeout);
            }
        }

        self.regs.write_register(
            SdRegister::ClockControl,
            clock_control | CLOCK_CONTROL_SD_CLOCK_ENABLE,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A behavioral register file standing in for controller hardware.
    struct SimRegisters {
        registers: [u32; 64],
        /// Complete commands by raising command-complete (and buffer
        /// ready when a data phase is attached).
        complete_commands: bool,
        /// Report a command timeout error on every command instead.
        timeout_commands: bool,
        /// Clear software reset bits as soon as they are written.
        auto_clear_reset: bool,
        /// Words the data port produces on reads.
        read_words: Vec<u32>,
        read_position: usize,
        /// Words written to the data port.
        written_words: Vec<u32>,
        /// Every value written to the command register.
        command_writes: Vec<u32>,
        /// Every value written to the clock control register.
        clock_writes: Vec<u32>,
    }

    impl SimRegisters {
        fn new() -> Self {
            Self {
                registers: [0; 64],
                complete_commands: true,
                timeout_commands: false,
                auto_clear_reset: true,
                read_words: Vec::new(),
                read_position: 0,
                written_words: Vec::new(),
                command_writes: Vec::new(),
                clock_writes: Vec::new(),
            }
        }

        fn set(&mut self, register: SdRegister, value: u32) {
            self.registers[register.offset() / 4] = value;
        }

        fn words_remaining(&self) -> bool {
            self.read_position < self.read_words.len()
        }
    }

    impl RegisterBus for SimRegisters {
        fn read_register(&mut self, register: SdRegister) -> u32 {
            match register {
                SdRegister::BufferDataPort => {
                    let word = self.read_words.get(self.read_position).copied().unwrap_or(0);
                    self.read_position += 1;
                    word
                }
                _ => self.registers[register.offset() / 4],
            }
        }

        fn write_register(&mut self, register: SdRegister, value: u32) {
            let index = register.offset() / 4;
            match register {
                SdRegister::InterruptStatus => {
                    // Write-one-to-clear; keep read-ready up while data
                    // remains.
                    self.registers[index] &= !value;
                    if self.words_remaining() {
                        self.registers[index] |= INT_STATUS_BUFFER_READ_READY;
                    }
                }
                SdRegister::BufferDataPort => {
                    self.written_words.push(value);
                }
                SdRegister::Command => {
                    self.command_writes.push(value);
                    let status_index = SdRegister::InterruptStatus.offset() / 4;
                    if self.timeout_commands {
                        self.registers[status_index] |=
                            INT_STATUS_ERROR_INTERRUPT | INT_STATUS_COMMAND_TIMEOUT_ERROR;
                    } else if self.complete_commands {
                        self.registers[status_index] |= INT_STATUS_COMMAND_COMPLETE;
                        if value & COMMAND_DATA_PRESENT != 0 {
                            if value & COMMAND_TRANSFER_READ != 0 {
                                self.registers[status_index] |= INT_STATUS_BUFFER_READ_READY;
                            } else {
                                self.registers[status_index] |= INT_STATUS_BUFFER_WRITE_READY;
                            }
                        }
                    }
                }
                SdRegister::ClockControl => {
                    self.clock_writes.push(value);
                    let mut stored = value;
                    if self.auto_clear_reset {
                        stored &= !(CLOCK_CONTROL_RESET_ALL
                            | CLOCK_CONTROL_RESET_COMMAND_LINE
                            | CLOCK_CONTROL_RESET_DATA_LINE);
                    }

                    if stored & CLOCK_CONTROL_INTERNAL_CLOCK_ENABLE != 0 {
                        stored |= CLOCK_CONTROL_CLOCK_STABLE;
                    }

                    self.registers[index] = stored;
                }
                _ => self.registers[index] = value,
            }
        }
    }

    fn host_with_capabilities(capability_bits: u32, version: u32) -> StandardHost<SimRegisters> {
        let mut sim = SimRegisters::new();
        sim.set(SdRegister::Capabilities, capability_bits);
        sim.set(SdRegister::SlotStatusVersion, version << 16);
        StandardHost::new(sim)
    }

    fn initialized_host(
        capability_bits: u32,
        version: u32,
        host_capabilities: Capabilities,
    ) -> StandardHost<SimRegisters> {
        let mut host = host_with_capabilities(capability_bits, version);
        let mut bus = BusParameters {
            host_capabilities,
            ..Default::default()
        };

        host.initialize(InitPhase::GatherCapabilities, &mut bus)
            .expect("phase 0 should succeed");

        host
    }

    // 48 MHz base clock: the widest value the pre-version-3 six-bit
    // frequency field can carry is 63.
    const BASIC_CAPABILITIES: u32 =
        CAPABILITY_VOLTAGE_3V3 | CAPABILITY_HIGH_SPEED | (48 << CAPABILITY_BASE_CLOCK_FREQUENCY_SHIFT);

    #[test]
    fn phase_zero_derives_voltage_and_clock() {
        let mut host = host_with_capabilities(BASIC_CAPABILITIES, HOST_VERSION_2);
        let mut bus = BusParameters::default();
        host.initialize(InitPhase::GatherCapabilities, &mut bus)
            .unwrap();

        assert_eq!(bus.voltages, Voltages::V32_33 | Voltages::V33_34);
        assert_eq!(bus.fundamental_clock, 48_000_000);
        assert!(bus.host_capabilities.contains(Capabilities::HIGH_SPEED));
        assert!(
            bus.host_capabilities
                .contains(Capabilities::HIGH_SPEED_52MHZ)
        );

        // The power level was programmed for 3.3V.
        assert_eq!(
            host.regs.registers[SdRegister::HostControl.offset() / 4] & HOST_CONTROL_POWER_3V3,
            HOST_CONTROL_POWER_3V3
        );
    }

    #[test]
    fn phase_zero_fails_without_voltages() {
        let mut host = host_with_capabilities(96 << CAPABILITY_BASE_CLOCK_FREQUENCY_SHIFT, 0);
        let mut bus = BusParameters::default();
        assert_eq!(
            host.initialize(InitPhase::GatherCapabilities, &mut bus),
            Err(SdError::NotReady)
        );
    }

    #[test]
    fn phase_zero_fails_without_clock() {
        let mut host = host_with_capabilities(CAPABILITY_VOLTAGE_3V3, 0);
        let mut bus = BusParameters::default();
        assert_eq!(
            host.initialize(InitPhase::GatherCapabilities, &mut bus),
            Err(SdError::NotReady)
        );
    }

    #[test]
    fn phase_one_applies_power_and_masks() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        let mut bus = BusParameters::default();
        host.initialize(InitPhase::ApplyPower, &mut bus).unwrap();

        let control = host.regs.registers[SdRegister::HostControl.offset() / 4];
        assert!(control & HOST_CONTROL_POWER_ENABLE != 0);
        assert_eq!(
            host.regs.registers[SdRegister::InterruptStatusEnable.offset() / 4],
            INT_STATUS_ENABLE_DEFAULT_MASK
        );
        assert_eq!(
            host.regs.registers[SdRegister::InterruptSignalEnable.offset() / 4],
            0
        );
    }

    #[test]
    fn divisor_search_powers_of_two() {
        assert_eq!(compute_divisor(HOST_VERSION_2, 96_000_000, 25_000_000), 4);
        assert_eq!(compute_divisor(HOST_VERSION_2, 100_000_000, 20_000_000), 8);
        assert_eq!(compute_divisor(HOST_VERSION_2, 96_000_000, 96_000_000), 1);
        assert_eq!(compute_divisor(HOST_VERSION_2, 96_000_000, 400_000), 256);
    }

    #[test]
    fn divisor_search_even_steps() {
        assert_eq!(compute_divisor(HOST_VERSION_3, 96_000_000, 25_000_000), 4);
        // Exact granularity: 100 / 6 = 16.7 MHz is the first even divisor
        // at or under 20 MHz.
        assert_eq!(compute_divisor(HOST_VERSION_3, 100_000_000, 20_000_000), 6);
        assert_eq!(compute_divisor(HOST_VERSION_3, 96_000_000, 96_000_000), 0);
    }

    #[test]
    fn set_clock_enables_stable_clock() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.set_clock_speed(25_000_000).unwrap();

        let clock = host.regs.registers[SdRegister::ClockControl.offset() / 4];
        assert!(clock & CLOCK_CONTROL_SD_CLOCK_ENABLE != 0);
        assert!(clock & CLOCK_CONTROL_INTERNAL_CLOCK_ENABLE != 0);

        // 48 MHz / 2 reaches 24 MHz; divisor 2 is encoded as 1 in the
        // low divisor field.
        assert_eq!(
            (clock >> CLOCK_CONTROL_DIVISOR_SHIFT) & CLOCK_CONTROL_DIVISOR_MASK,
            1
        );
    }

    #[test]
    fn reset_completes_when_bits_clear() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.reset(ResetFlags::ALL).unwrap();
        let requested = host
            .regs
            .clock_writes
            .iter()
            .any(|value| value & CLOCK_CONTROL_RESET_ALL != 0);

        assert!(requested);
        assert_eq!(
            host.regs.registers[SdRegister::InterruptStatusEnable.offset() / 4],
            INT_STATUS_ENABLE_DEFAULT_MASK
        );
    }

    #[test]
    fn reset_times_out_when_bits_stick() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.regs.auto_clear_reset = false;
        assert_eq!(host.reset(ResetFlags::ALL), Err(SdError::Timeout));
    }

    #[test]
    fn send_command_captures_short_response() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.regs.set(SdRegister::Response10, 0xDEAD_BEEF);

        let mut command = SdCommand::new(SdOpcode::SendStatus, ResponseType::R1, 0x1234);
        host.send_command(&mut command).unwrap();
        assert_eq!(command.response[0], 0xDEAD_BEEF);
        assert_eq!(
            host.regs.registers[SdRegister::Argument1.offset() / 4],
            0x1234
        );

        let written = *host.regs.command_writes.last().unwrap();
        assert_eq!(written >> COMMAND_INDEX_SHIFT, 13);
        assert!(written & COMMAND_CRC_CHECK_ENABLE != 0);
        assert!(written & COMMAND_INDEX_CHECK_ENABLE != 0);
    }

    #[test]
    fn send_command_times_out_without_interrupts() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.regs.complete_commands = false;

        let mut command = SdCommand::new(SdOpcode::SendStatus, ResponseType::R1, 0);
        assert_eq!(host.send_command(&mut command), Err(SdError::Timeout));
    }

    #[test]
    fn command_timeout_resets_the_command_line() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.regs.timeout_commands = true;

        let mut command = SdCommand::new(SdOpcode::SendStatus, ResponseType::R1, 0);
        assert_eq!(host.send_command(&mut command), Err(SdError::Timeout));

        let reset_issued = host
            .regs
            .clock_writes
            .iter()
            .any(|value| value & CLOCK_CONTROL_RESET_COMMAND_LINE != 0);

        assert!(reset_issued);
    }

    #[test]
    fn long_response_is_unshifted_by_default() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.regs.set(SdRegister::Response10, 0x0101_0101);
        host.regs.set(SdRegister::Response32, 0x0202_0202);
        host.regs.set(SdRegister::Response54, 0x0303_0303);
        host.regs.set(SdRegister::Response76, 0x0404_0404);

        let mut command = SdCommand::new(SdOpcode::SendCardSpecificData, ResponseType::R2, 0);
        host.send_command(&mut command).unwrap();
        assert_eq!(
            command.response,
            [0x0404_0404, 0x0303_0303, 0x0202_0202, 0x0101_0101]
        );
    }

    #[test]
    fn long_response_shift_quirk() {
        let mut host = initialized_host(
            BASIC_CAPABILITIES,
            HOST_VERSION_2,
            Capabilities::RESPONSE_136_SHIFTED,
        );

        host.regs.set(SdRegister::Response10, 0xDD00_0000);
        host.regs.set(SdRegister::Response32, 0xCC00_0000);
        host.regs.set(SdRegister::Response54, 0xBB00_0000);
        host.regs.set(SdRegister::Response76, 0x0000_00AA);

        let mut command = SdCommand::new(SdOpcode::SendCardSpecificData, ResponseType::R2, 0);
        host.send_command(&mut command).unwrap();
        assert_eq!(
            command.response,
            [0x0000_AABB, 0x0000_00CC, 0x0000_00DD, 0x0000_0000]
        );
    }

    #[test]
    fn fifo_read_moves_words_into_buffer() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        host.regs.read_words = vec![0x0403_0201, 0x0807_0605];

        let mut buffer = [0u8; 8];
        let mut command = SdCommand::new(SdOpcode::SendSdConfigurationRegister, ResponseType::R1, 0)
            .with_read(&mut buffer);

        host.send_command(&mut command).unwrap();
        drop(command);
        assert_eq!(buffer, [1, 2, 3, 4, 5, 6, 7, 8]);

        // Single-block transfers program the byte count directly.
        assert_eq!(
            host.regs.registers[SdRegister::BlockSizeCount.offset() / 4],
            8 | SIZE_SDMA_BOUNDARY_512K
        );
    }

    #[test]
    fn fifo_write_moves_words_out_of_buffer() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());

        let buffer: Vec<u8> = (0u8..8).collect();
        let mut command = SdCommand::new(SdOpcode::WriteSingleBlock, ResponseType::R1, 0)
            .with_write(&buffer);

        host.send_command(&mut command).unwrap();
        assert_eq!(host.regs.written_words, vec![0x0302_0100, 0x0706_0504]);
    }

    #[test]
    fn multiple_block_commands_program_the_block_count() {
        let mut host = initialized_host(
            BASIC_CAPABILITIES,
            HOST_VERSION_2,
            Capabilities::AUTO_CMD12,
        );

        host.regs.read_words = vec![0; 256];
        let mut buffer = [0u8; 1024];
        let mut command = SdCommand::new(SdOpcode::ReadMultipleBlocks, ResponseType::R1, 0)
            .with_read(&mut buffer);

        host.send_command(&mut command).unwrap();

        assert_eq!(
            host.regs.registers[SdRegister::BlockSizeCount.offset() / 4],
            512 | SIZE_SDMA_BOUNDARY_512K | (2 << SIZE_BLOCK_COUNT_SHIFT)
        );

        let written = *host.regs.command_writes.last().unwrap();
        assert!(written & COMMAND_MULTIPLE_BLOCKS != 0);
        assert!(written & COMMAND_BLOCK_COUNT_ENABLE != 0);
        assert!(written & COMMAND_AUTO_COMMAND12_ENABLE != 0);
    }

    #[test]
    fn bus_width_round_trip() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        assert_eq!(host.bus_width().unwrap(), 1);

        host.set_bus_width(4).unwrap();
        assert_eq!(host.bus_width().unwrap(), 4);

        host.set_bus_width(8).unwrap();
        assert_eq!(host.bus_width().unwrap(), 8);

        assert_eq!(host.set_bus_width(3), Err(SdError::InvalidParameter));
    }

    #[test]
    fn clock_speed_is_not_readable() {
        let mut host = initialized_host(BASIC_CAPABILITIES, HOST_VERSION_2, Capabilities::empty());
        assert_eq!(host.clock_speed(), Err(SdError::Unsupported));
    }
}
