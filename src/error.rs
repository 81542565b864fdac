//! Error definitions for the SD/MMC stack.

/// Errors returned by the SD/MMC engine and host controller backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// A bounded poll exhausted its time budget.
    Timeout,
    /// The controller reported an error interrupt, or the card returned
    /// error status bits.
    DeviceError,
    /// Malformed creation parameters, a bad bus width, or an unsupported
    /// parameter combination.
    InvalidParameter,
    /// No card is present or the controller is not initialized yet.
    NotReady,
    /// There is no medium in the slot.
    NoMedia,
    /// The medium was removed or replaced since it was initialized.
    MediaChanged,
    /// The feature is not supported by the host or the card.
    Unsupported,
    /// Allocation failure during creation.
    OutOfResources,
}
