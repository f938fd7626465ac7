//! Events reported by a device to the application

pub mod callback;
pub use callback::*;

pub mod channel;
pub use channel::*;

use bytes::Bytes;

use crate::error::Error;

/// Something the application may want to react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Bring-up completed, the device is ready
    Created,
    /// The device reached `Closed`
    Closed {
        /// Whether the device had been created; `false` when bring-up never completed
        created: bool,
    },
    /// The connection is being torn down because of this error
    Error(Error),
    /// Presence or connection of a card changed
    ReaderStatus {
        /// Slot number
        slot: u8,
        /// A card is present
        present: bool,
        /// The card is powered and its ATR known
        connected: bool,
    },
    /// A card was powered on
    CardConnected {
        /// Slot number
        slot: u8,
        /// Answer-to-reset
        atr: Bytes,
    },
    /// A card was powered off
    CardDisconnected {
        /// Slot number
        slot: u8,
    },
    /// Answer to an APDU
    TransmitResponse {
        /// Slot number
        slot: u8,
        /// Response APDU
        response: Bytes,
    },
    /// Answer to an escape command
    ControlResponse {
        /// Response payload
        response: Bytes,
    },
    /// The device entered or left low power mode
    PowerState {
        /// `true` while sleeping
        low_power: bool,
    },
    /// A command on a slot failed; the device stays usable
    ReaderOrCardError {
        /// Slot number
        slot: u8,
        /// What went wrong
        error: Error,
    },
}
