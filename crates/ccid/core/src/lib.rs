//! CCID framing and secure channel for multi-slot smart card readers
//!
//! This crate holds the wire level pieces shared by the host stack and the reader
//! firmware:
//!
//! - [`frame`]: encoding and decoding of the 10 byte CCID header and its payload,
//!   sequence numbering and reassembly of frames split by the transport
//! - [`status`]: decoding of the slot status and slot error bytes
//! - [`secure`]: the AES-128 mutual authentication and the per-frame
//!   encrypt-then-CMAC protection
//!
//! It does no I/O; the device crate drives it from transport events.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub use bytes::{Bytes, BytesMut};

pub mod constants;
pub mod frame;
pub mod secure;
pub mod status;

mod error;
pub use error::{AuthFailure, Error, FrameError, Result};

pub use frame::{
    CommandCode, CommandEncoder, Frame, FrameAssembler, ResponseCode, SlotChange, decode_slot_change,
};
pub use secure::{
    DeviceHandshake, HandshakeProgress, HostHandshake, KeyIndex, Role, SecureParameters,
    SecureSession,
};
pub use status::{CommandStatus, IccStatus, SlotError, SlotStatus};
