//! Byte transport consumed by the device
//!
//! A transport moves opaque bytes between the host and the reader, over USB bulk
//! endpoints or BLE characteristics. It reports what happens on the link by feeding
//! [`TransportEvent`]s to [`Device::handle_transport_event`](crate::Device::handle_transport_event)
//! or by calling the matching `on_*` methods directly.

use std::fmt;

use bytes::Bytes;

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection error
    #[error("Failed to connect to device")]
    Connection,

    /// Transmission error
    #[error("Failed to transmit data")]
    Transmission,

    /// The link is down
    #[error("Device is not connected")]
    Disconnected,

    /// The transport does not implement the operation
    #[error("Operation not supported by the transport")]
    Unsupported,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }
}

/// Link level operations the device needs
///
/// Every method returns once the request is handed to the link; outcomes arrive later
/// as [`TransportEvent`]s.
pub trait Transport: Send + fmt::Debug {
    /// Open the link. Completion is reported with [`TransportEvent::Connected`].
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link. Completion is reported with [`TransportEvent::Disconnected`].
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Send one complete frame
    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Ask a sleeping device to wake up
    fn wake_up(&mut self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }
}

/// Something that happened on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link is up
    Connected,
    /// Link is down
    Disconnected,
    /// Bytes received on the response channel (may be a partial frame)
    Data(Bytes),
    /// Bytes received on the status channel
    Status(Bytes),
    /// The device entered (`true`) or left (`false`) low power mode
    SleepState(bool),
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    /// Frames written by the device
    pub(crate) written: Vec<Bytes>,
    /// Connect and disconnect requests, in order
    pub(crate) requests: Vec<&'static str>,
    /// Fail every write
    pub(crate) fail_writes: bool,
    /// Fail disconnect requests
    pub(crate) fail_disconnect: bool,
}

#[cfg(test)]
impl Transport for MockTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.requests.push("connect");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.requests.push("disconnect");
        if self.fail_disconnect {
            return Err(TransportError::other("link stuck"));
        }
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes {
            return Err(TransportError::Transmission);
        }
        self.written.push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}
