//! Configuration accepted when a device connection is opened

use std::time::Duration;

use bytes::Bytes;
use pcsclike_ccid::constants::escape;
pub use pcsclike_ccid::{KeyIndex, SecureParameters};

/// One item read from the device during bring-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoProbe {
    /// Query the status of a slot
    SlotStatus(u8),
    /// Send a raw escape (CONTROL) command
    Escape(Bytes),
}

impl InfoProbe {
    /// Build a probe from its raw form: a single byte is a slot status probe,
    /// anything longer is an escape command
    pub fn from_raw(raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        match raw.as_ref() {
            [slot] => Self::SlotStatus(*slot),
            _ => Self::Escape(raw),
        }
    }

    /// GET_DATA of the firmware revision string
    pub fn firmware_revision() -> Self {
        Self::Escape(Bytes::from_static(&[
            escape::CLA,
            escape::INS_GET_DATA,
            escape::ID_FIRMWARE_REVISION,
        ]))
    }

    /// GET_SLOT_NAME of slot `index`
    pub fn slot_name(index: u8) -> Self {
        Self::Escape(Bytes::copy_from_slice(&[
            escape::CLA,
            escape::INS_GET_SLOT_NAME,
            index,
        ]))
    }
}

/// Bounds for the blocking API waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Connect plus the whole bring-up
    pub create: Duration,
    /// Card power on or power off
    pub card_connect: Duration,
    /// Any other command and its response
    pub response: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: Duration::from_secs(10),
            card_connect: Duration::from_secs(5),
            response: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Set all three bounds to the same value
    pub const fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            card_connect: timeout,
            response: timeout,
        }
    }

    /// Set the bring-up bound
    pub const fn with_create(mut self, timeout: Duration) -> Self {
        self.create = timeout;
        self
    }

    /// Set the card connect bound
    pub const fn with_card_connect(mut self, timeout: Duration) -> Self {
        self.card_connect = timeout;
        self
    }

    /// Set the response bound
    pub const fn with_response(mut self, timeout: Duration) -> Self {
        self.response = timeout;
        self
    }
}

/// Configuration options for a device session
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Secure channel key, `None` for a plain session
    pub secure: Option<SecureParameters>,

    /// Probes run in order during bring-up
    pub info_probes: Vec<InfoProbe>,

    /// Slots powered on automatically, in order
    pub auto_connect: Vec<u8>,

    /// Slots known before bring-up starts (e.g. from a USB descriptor)
    pub slot_count: u8,

    /// Bounds for the blocking API
    pub timeouts: Timeouts,
}

impl DeviceConfig {
    /// Create a new default configuration: plain session, no probes, no auto-connect
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the secure channel
    pub fn with_secure(mut self, params: SecureParameters) -> Self {
        self.secure = Some(params);
        self
    }

    /// Append a bring-up probe
    pub fn with_info_probe(mut self, probe: InfoProbe) -> Self {
        self.info_probes.push(probe);
        self
    }

    /// Append a slot status probe
    pub fn with_slot_status_probe(self, slot: u8) -> Self {
        self.with_info_probe(InfoProbe::SlotStatus(slot))
    }

    /// Append a slot name probe
    pub fn with_slot_name_probe(self, slot: u8) -> Self {
        self.with_info_probe(InfoProbe::slot_name(slot))
    }

    /// Append a firmware revision probe
    pub fn with_firmware_revision_probe(self) -> Self {
        self.with_info_probe(InfoProbe::firmware_revision())
    }

    /// Power on the card in `slot` during bring-up and whenever one is inserted
    pub fn with_auto_connect(mut self, slot: u8) -> Self {
        self.auto_connect.push(slot);
        self
    }

    /// Declare the number of slots up front
    pub const fn with_slot_count(mut self, count: u8) -> Self {
        self.slot_count = count;
        self
    }

    /// Set the blocking API bounds
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Whether the secure channel is requested
    pub const fn is_secure(&self) -> bool {
        self.secure.is_some()
    }
}
