//! Generic SD/MMC driver stack for boot firmware.
//!
//! This library brings SD and MMC cards from power-on to negotiated block
//! I/O before an operating system exists: no scheduler, no interrupts, no
//! DMA, every wait a bounded busy-poll. It is split into a generic
//! protocol engine ([`controller`]) that owns the card state machine, and
//! host-controller backends behind the [`host::SdHost`] operation table.
//! The standard register layout is implemented in [`sdhci`]; a platform
//! with a different controller supplies its own backend at creation time.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod card;
pub mod command;
pub mod controller;
pub mod error;
pub mod host;
pub mod sdhci;
pub mod slot;
pub mod time;

pub use card::{CardIdentification, ClockSpeed, SdVersion};
pub use command::{DataTransfer, ResponseType, SdCommand, SdOpcode};
pub use controller::{MediaParameters, SdController, SdControllerParameters, SlotCallbacks};
pub use error::SdError;
pub use host::{BusParameters, Capabilities, InitPhase, ResetFlags, SdHost, Voltages};
pub use sdhci::{MmioRegisters, RegisterBus, StandardHost, StandardSdHost};
