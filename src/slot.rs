//! Slot registry for initialized controllers.
//!
//! Boot firmware brings each physical slot up once during device
//! enumeration and afterwards reaches storage through a stable index,
//! typically from filesystem code that only knows "boot disk 0". The
//! registry holds standard-backend controllers; platforms with override
//! backends own their controllers directly.

use spin::Mutex;

use crate::controller::SdController;
use crate::error::SdError;
use crate::sdhci::StandardSdHost;

/// Maximum number of slots the registry can track.
pub const MAX_SLOTS: usize = 4;

/// Wrapper for a controller pointer to implement Send.
struct SlotPtr(*mut SdController<StandardSdHost>);

// Safety: access is serialized through the registry mutex, and each
// controller is only ever driven from one execution context.
unsafe impl Send for SlotPtr {}

/// Registered controllers, one per physical slot.
static SLOTS: Mutex<heapless::Vec<SlotPtr, MAX_SLOTS>> = Mutex::new(heapless::Vec::new());

/// Register a controller, returning its slot index.
pub fn register(controller: &'static mut SdController<StandardSdHost>) -> Result<usize, SdError> {
    let mut slots = SLOTS.lock();
    let index = slots.len();
    slots
        .push(SlotPtr(controller))
        .map_err(|_| SdError::OutOfResources)?;

    log::info!("SD: slot {} registered", index);
    Ok(index)
}

/// Get a registered controller by slot index.
pub fn controller(index: usize) -> Option<&'static mut SdController<StandardSdHost>> {
    let slots = SLOTS.lock();
    slots.get(index).map(|slot| unsafe { &mut *slot.0 })
}

/// Number of registered slots.
pub fn count() -> usize {
    SLOTS.lock().len()
}

/// Read blocks from a registered slot.
///
/// Convenience entry point for firmware filesystem code.
pub fn read_blocks(index: usize, block_offset: u64, buffer: &mut [u8]) -> Result<(), SdError> {
    let Some(controller) = controller(index) else {
        log::error!("SD: no controller in slot {}", index);
        return Err(SdError::NotReady);
    };

    controller.read_blocks(block_offset, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::SdControllerParameters;

    // The registry is a process-wide static, so everything is exercised
    // in a single test.
    #[test]
    fn registry_round_trip() {
        assert_eq!(count(), 0);
        assert!(controller(0).is_none());
        assert_eq!(
            read_blocks(0, 0, &mut [0u8; 512]),
            Err(SdError::NotReady)
        );

        // A register block that is never initialized; creation does not
        // touch it.
        let registers = Box::leak(Box::new([0u32; 64]));
        let parameters = SdControllerParameters {
            controller_base: Some(registers.as_ptr() as usize),
            ..Default::default()
        };

        let slot_controller = Box::leak(Box::new(SdController::create(&parameters).unwrap()));
        let index = register(slot_controller).unwrap();
        assert_eq!(index, 0);
        assert_eq!(count(), 1);

        let found = controller(0).unwrap();
        assert_eq!(found.media_parameters(), Err(SdError::NoMedia));
    }
}
