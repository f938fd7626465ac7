//! AES-128 secure channel
//!
//! The host and the reader authenticate each other with a shared static key, then
//! every CCID frame in both directions is encrypted with AES-CBC and authenticated
//! with a truncated CBC-MAC. See [`HostHandshake`] for the message flow.

pub mod crypto;
mod handshake;
mod session;

pub use handshake::{DeviceHandshake, HandshakeProgress, HostHandshake, KeyIndex, SecureParameters};
pub use session::{Role, SecureSession, SessionKeys};
