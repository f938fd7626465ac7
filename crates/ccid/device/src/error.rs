//! Error types for the device layer

use pcsclike_ccid::{FrameError, SlotError};

use crate::transport::TransportError;

/// Result type for device operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a device session
///
/// Errors are `Clone` so they can travel inside [`DeviceEvent`](crate::DeviceEvent)s.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Frame codec or secure channel error
    #[error(transparent)]
    Ccid(#[from] pcsclike_ccid::Error),

    /// The device cannot take a command right now
    #[error("Device is busy: {0}")]
    Busy(&'static str),

    /// The transport dropped while a command or the bring-up was outstanding
    #[error("Device disconnected while processing command")]
    DeviceNotConnected,

    /// Response that cannot belong to this session
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Response code that does not match the command in flight
    #[error("Dialog error: {0}")]
    Dialog(String),

    /// The card could not process the command
    #[error("Card communication error: {0}")]
    CardCommunication(String),

    /// Unexpected content in a device information response
    #[error("Dummy device: {0}")]
    DummyDevice(String),

    /// The reader reported an error for a slot
    #[error("Slot {slot}: {code}")]
    Slot {
        /// Slot number
        slot: u8,
        /// Decoded slot error
        code: SlotError,
    },

    /// Command addressed to a slot the device does not have
    #[error("No such slot: {0}")]
    NoSuchSlot(u8),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No answer within the configured delay
    #[error("Operation timed out")]
    Timeout,

    /// The device is not connected
    #[error("Device is closed")]
    Closed,
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        Self::Ccid(err.into())
    }
}

impl Error {
    /// Whether the error is a failed mutual authentication
    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Ccid(err) if err.is_authentication())
    }

    /// Whether the error is a secure channel integrity failure
    pub const fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Ccid(err) if err.is_integrity_failure())
    }
}
