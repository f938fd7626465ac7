//! Simulated reader
//!
//! [`SimulatedReader`] plays the firmware side of the protocol: slots and cards, the
//! CONTROL commands read during bring-up, and the device half of the secure channel.
//! [`SimTransport`] loops commands through it and reports everything the way a real
//! link would, as [`TransportEvent`]s on a channel.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use pcsclike_ccid::constants::{escape, secure, slot_error};
use pcsclike_ccid::{
    CommandCode, CommandStatus, DeviceHandshake, Frame, IccStatus, ResponseCode, SecureParameters,
    SecureSession, SlotStatus,
};
use tracing::{debug, trace, warn};

use crate::device::Device;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Opcode the simulated firmware answers a rejected authentication step with
pub const AUTH_REJECTED: u8 = 0x6F;

type Responder = Box<dyn FnMut(&[u8]) -> Bytes + Send>;

/// A card sitting in a simulated slot
pub struct SimCard {
    atr: Bytes,
    responder: Responder,
    mute: bool,
}

impl fmt::Debug for SimCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimCard")
            .field("atr", &hex::encode(&self.atr))
            .field("mute", &self.mute)
            .finish_non_exhaustive()
    }
}

impl SimCard {
    /// A card answering `90 00` to every APDU
    pub fn new(atr: impl Into<Bytes>) -> Self {
        Self::with_responder(atr, |_| Bytes::from_static(&[0x90, 0x00]))
    }

    /// A card answering APDUs with `responder`
    pub fn with_responder(
        atr: impl Into<Bytes>,
        responder: impl FnMut(&[u8]) -> Bytes + Send + 'static,
    ) -> Self {
        Self {
            atr: atr.into(),
            responder: Box::new(responder),
            mute: false,
        }
    }

    /// A card that never answers the power on
    pub fn mute(atr: impl Into<Bytes>) -> Self {
        Self {
            mute: true,
            ..Self::new(atr)
        }
    }
}

#[derive(Debug)]
struct SimSlot {
    name: String,
    card: Option<SimCard>,
    powered: bool,
}

impl SimSlot {
    fn icc(&self) -> IccStatus {
        match (&self.card, self.powered) {
            (None, _) => IccStatus::Absent,
            (Some(_), true) => IccStatus::Active,
            (Some(_), false) => IccStatus::Inactive,
        }
    }
}

/// Firmware of a simulated multi-slot reader
#[derive(Debug)]
pub struct SimulatedReader {
    slots: Vec<SimSlot>,
    firmware_revision: String,
    key: Option<SecureParameters>,
    handshake: Option<DeviceHandshake>,
    session: Option<SecureSession>,
    silent: bool,
    sleeping: bool,
    history: Vec<(CommandCode, u8)>,
}

impl Default for SimulatedReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedReader {
    /// A reader without slots
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            firmware_revision: "SpringCore 1.52 [r4251]".into(),
            key: None,
            handshake: None,
            session: None,
            silent: false,
            sleeping: false,
            history: Vec::new(),
        }
    }

    /// Add an empty slot
    pub fn with_slot(mut self, name: impl Into<String>) -> Self {
        self.slots.push(SimSlot {
            name: name.into(),
            card: None,
            powered: false,
        });
        self
    }

    /// Insert a card in the last slot added
    pub fn with_card(mut self, card: SimCard) -> Self {
        if let Some(slot) = self.slots.last_mut() {
            slot.card = Some(card);
        }
        self
    }

    /// Report this firmware revision string
    pub fn with_firmware_revision(mut self, revision: impl Into<String>) -> Self {
        self.firmware_revision = revision.into();
        self
    }

    /// Require the mutual authentication with this key
    pub fn with_key(mut self, key: SecureParameters) -> Self {
        self.key = Some(key);
        self
    }

    /// Never answer any command
    pub const fn unresponsive(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Stop (or resume) answering commands
    pub const fn set_unresponsive(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Commands received so far, with their slot, oldest first
    pub fn history(&self) -> &[(CommandCode, u8)] {
        &self.history
    }

    /// Number of slots
    pub fn slot_count(&self) -> u8 {
        self.slots.len() as u8
    }

    /// Whether the secure channel is established
    pub const fn is_secure(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the reader is in low power mode
    pub const fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// The link came up: forget any previous session
    pub fn power_up(&mut self) {
        self.session = None;
        self.handshake = self.key.clone().map(DeviceHandshake::new);
        self.sleeping = false;
        for slot in &mut self.slots {
            slot.powered = false;
        }
    }

    /// Insert a card and build the matching slot change notification
    pub fn insert_card(&mut self, index: u8, card: SimCard) -> Option<Bytes> {
        let slot = self.slots.get_mut(index as usize)?;
        slot.card = Some(card);
        slot.powered = false;
        Some(self.slot_change(index))
    }

    /// Remove a card and build the matching slot change notification
    pub fn remove_card(&mut self, index: u8) -> Option<Bytes> {
        let slot = self.slots.get_mut(index as usize)?;
        slot.card = None;
        slot.powered = false;
        Some(self.slot_change(index))
    }

    /// `RDR_to_PC_NotifySlotChange` with the changed bit set for `changed`
    fn slot_change(&self, changed: u8) -> Bytes {
        let mut message = vec![0u8; 1 + self.slots.len().div_ceil(4)];
        message[0] = pcsclike_ccid::constants::response::NOTIFY_SLOT_CHANGE;
        for (index, slot) in self.slots.iter().enumerate() {
            let mut bits = u8::from(slot.card.is_some());
            if index == changed as usize {
                bits |= 0x02;
            }
            message[1 + index / 4] |= bits << ((index % 4) * 2);
        }
        Bytes::from(message)
    }

    /// Process one command frame, returning the response to send back
    pub fn handle_command(&mut self, raw: &[u8]) -> Option<Bytes> {
        let command = match self.session.as_mut() {
            Some(session) => session.open_bytes(raw),
            None => Frame::decode(raw).map_err(Into::into),
        };
        let command = match command {
            Ok(command) => command,
            Err(err) => {
                warn!(%err, "simulated reader dropped a command");
                return None;
            }
        };
        if let Ok(code) = command.command_code() {
            self.history.push((code, command.slot));
        }
        if self.silent {
            trace!(seq = command.seq, "simulated reader stays silent");
            return None;
        }

        // the last authentication answer still travels in plain
        let was_secure = self.session.is_some();
        let (code, status, error, payload) = self.execute(&command);
        let response = Frame::response(code, command.slot, command.seq, status, error, payload);
        match self.session.as_mut() {
            Some(session) if was_secure => session.seal_bytes(&response).ok(),
            _ => Some(response.encode()),
        }
    }

    fn execute(&mut self, command: &Frame) -> (ResponseCode, SlotStatus, u8, Bytes) {
        let Ok(code) = command.command_code() else {
            return failed(ResponseCode::SlotStatus, IccStatus::Absent, 0x00);
        };
        if code == CommandCode::Escape {
            return self.escape(&command.payload);
        }

        let Some(slot) = self.slots.get_mut(command.slot as usize) else {
            // bad slot index
            return failed(ResponseCode::SlotStatus, IccStatus::Absent, 0x05);
        };
        let icc = slot.icc();
        match code {
            CommandCode::GetSlotStatus => ok(ResponseCode::SlotStatus, icc, Bytes::new()),
            CommandCode::IccPowerOn => match &slot.card {
                None => failed(ResponseCode::DataBlock, icc, slot_error::ICC_MUTE),
                Some(card) if card.mute => failed(ResponseCode::DataBlock, icc, slot_error::ICC_MUTE),
                Some(card) => {
                    let atr = card.atr.clone();
                    slot.powered = true;
                    ok(ResponseCode::DataBlock, IccStatus::Active, atr)
                }
            },
            CommandCode::IccPowerOff => {
                slot.powered = false;
                ok(ResponseCode::SlotStatus, slot.icc(), Bytes::new())
            }
            CommandCode::XfrBlock => match (&mut slot.card, slot.powered) {
                (Some(card), true) => {
                    let response = (card.responder)(&command.payload);
                    ok(ResponseCode::DataBlock, icc, response)
                }
                (Some(_), false) => ok(ResponseCode::SlotStatus, icc, Bytes::new()),
                (None, _) => failed(ResponseCode::SlotStatus, icc, slot_error::ICC_MUTE),
            },
            // command not supported
            _ => failed(ResponseCode::SlotStatus, icc, 0x00),
        }
    }

    fn escape(&mut self, payload: &[u8]) -> (ResponseCode, SlotStatus, u8, Bytes) {
        match payload {
            [secure::PROTOCOL_CODE, opcode, ..] if self.key.is_some() && self.session.is_none() => {
                let answer = self.authenticate(*opcode, payload);
                ok(ResponseCode::Escape, IccStatus::Absent, answer)
            }
            [escape::CLA, escape::INS_GET_DATA, escape::ID_FIRMWARE_REVISION, ..] => {
                let revision = self.firmware_revision.clone();
                ok(ResponseCode::Escape, IccStatus::Absent, prefixed(revision.as_bytes()))
            }
            [escape::CLA, escape::INS_GET_SLOT_NAME, index, ..] => match self.slots.get(*index as usize) {
                Some(slot) => ok(ResponseCode::Escape, IccStatus::Absent, prefixed(slot.name.as_bytes())),
                None => failed(ResponseCode::Escape, IccStatus::Absent, 0x05),
            },
            _ => failed(ResponseCode::Escape, IccStatus::Absent, 0x00),
        }
    }

    fn authenticate(&mut self, opcode: u8, payload: &[u8]) -> Bytes {
        let Some(handshake) = self.handshake.as_mut() else {
            return Bytes::from_static(&[AUTH_REJECTED]);
        };
        let answer = match opcode {
            secure::OPCODE_AUTHENTICATE => handshake.on_authenticate(payload),
            secure::OPCODE_FOLLOWING => handshake.on_step2(payload).map(|(answer, session)| {
                self.session = Some(session);
                answer
            }),
            _ => return Bytes::from_static(&[AUTH_REJECTED]),
        };
        answer.unwrap_or_else(|err| {
            debug!(%err, "simulated reader rejects the authentication");
            Bytes::from_static(&[AUTH_REJECTED])
        })
    }
}

fn ok(code: ResponseCode, icc: IccStatus, payload: Bytes) -> (ResponseCode, SlotStatus, u8, Bytes) {
    (code, SlotStatus::from_parts(icc, CommandStatus::Processed), 0, payload)
}

fn failed(code: ResponseCode, icc: IccStatus, error: u8) -> (ResponseCode, SlotStatus, u8, Bytes) {
    (code, SlotStatus::from_parts(icc, CommandStatus::Failed), error, Bytes::new())
}

fn prefixed(content: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(content.len() + 1);
    payload.push(0x00);
    payload.extend_from_slice(content);
    Bytes::from(payload)
}

/// Loopback transport in front of a [`SimulatedReader`]
#[derive(Debug)]
pub struct SimTransport {
    reader: Arc<Mutex<SimulatedReader>>,
    events: Sender<TransportEvent>,
    connected: bool,
    chunk_size: usize,
}

/// Test-side control of a simulated link
#[derive(Debug, Clone)]
pub struct SimHandle {
    reader: Arc<Mutex<SimulatedReader>>,
    events: Sender<TransportEvent>,
}

/// Connect a transport to `reader`
///
/// The receiver yields what the transport reports; feed it to
/// [`Device::handle_transport_event`] or to [`pump`].
pub fn link(reader: SimulatedReader) -> (SimTransport, SimHandle, Receiver<TransportEvent>) {
    let (events, receiver) = unbounded();
    let reader = Arc::new(Mutex::new(reader));
    let transport = SimTransport {
        reader: reader.clone(),
        events: events.clone(),
        connected: false,
        chunk_size: usize::MAX,
    };
    (transport, SimHandle { reader, events }, receiver)
}

impl SimTransport {
    /// Deliver responses in pieces of at most `size` bytes, like BLE notifications
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    fn report(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.events
            .send(event)
            .map_err(|_| TransportError::other("event receiver dropped"))
    }
}

impl Transport for SimTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.reader.lock().power_up();
        self.connected = true;
        self.report(TransportEvent::Connected)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.report(TransportEvent::Disconnected)
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        let response = self.reader.lock().handle_command(frame);
        if let Some(response) = response {
            for chunk in response.chunks(self.chunk_size) {
                self.report(TransportEvent::Data(Bytes::copy_from_slice(chunk)))?;
            }
        }
        Ok(())
    }

    fn wake_up(&mut self) -> Result<(), TransportError> {
        self.reader.lock().sleeping = false;
        self.report(TransportEvent::SleepState(false))
    }
}

impl SimHandle {
    /// Access the firmware
    pub fn reader(&self) -> parking_lot::MutexGuard<'_, SimulatedReader> {
        self.reader.lock()
    }

    /// Insert a card and notify the host
    pub fn insert_card(&self, slot: u8, card: SimCard) {
        let message = self.reader.lock().insert_card(slot, card);
        if let Some(message) = message {
            let _ = self.events.send(TransportEvent::Status(message));
        }
    }

    /// Remove a card and notify the host
    pub fn remove_card(&self, slot: u8) {
        let message = self.reader.lock().remove_card(slot);
        if let Some(message) = message {
            let _ = self.events.send(TransportEvent::Status(message));
        }
    }

    /// Put the reader in low power mode
    pub fn sleep(&self) {
        self.reader.lock().sleeping = true;
        let _ = self.events.send(TransportEvent::SleepState(true));
    }

    /// Drop the link as if the reader went out of range
    pub fn drop_link(&self) {
        let _ = self.events.send(TransportEvent::Disconnected);
    }
}

/// Feed every pending transport event to `device`, returning how many were handled
pub fn pump<T: Transport>(device: &mut Device<T>, events: &Receiver<TransportEvent>) -> usize {
    let mut handled = 0;
    while let Ok(event) = events.try_recv() {
        device.handle_transport_event(event);
        handled += 1;
    }
    handled
}
