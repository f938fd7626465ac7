//! Bring-up sequencer
//!
//! Runs while the device is `Creating`, in a fixed order:
//!
//! 1. mutual authentication, when a key is configured
//! 2. info probes, one at a time
//! 3. power on of the auto-connect slots, one at a time
//!
//! A phase with nothing to do is skipped. Once every queue is empty the device goes `Idle`.

use std::collections::VecDeque;
use std::mem;

use bytes::Bytes;
use pcsclike_ccid::constants::escape;
use pcsclike_ccid::{CommandCode, Frame, HandshakeProgress, HostHandshake, ResponseCode};
use tracing::{debug, warn};

use crate::config::{DeviceConfig, InfoProbe};
use crate::device::{Device, InFlight};
use crate::error::{Error, Result};
use crate::state::State;
use crate::transport::Transport;

/// Bring-up phase of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Phase {
    /// Running the mutual authentication
    Authenticate,
    /// Draining the info probes
    ReadInfo,
    /// Powering on the auto-connect slots
    ConnectCards,
    /// Bring-up over, responses are interpreted against the application's commands
    Steady,
}

/// What the sequencer waits for
#[derive(Debug)]
pub(crate) enum PendingOperation {
    Authenticate(HostHandshake),
    ReadInfo(VecDeque<InfoProbe>),
    ConnectCards(VecDeque<u8>),
    Steady,
}

impl PendingOperation {
    const fn phase(&self) -> Phase {
        match self {
            Self::Authenticate(_) => Phase::Authenticate,
            Self::ReadInfo(_) => Phase::ReadInfo,
            Self::ConnectCards(_) => Phase::ConnectCards,
            Self::Steady => Phase::Steady,
        }
    }
}

/// A command the device has to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutgoingCommand {
    pub(crate) code: CommandCode,
    pub(crate) slot: u8,
    pub(crate) payload: Bytes,
}

impl OutgoingCommand {
    pub(crate) const fn new(code: CommandCode, slot: u8, payload: Bytes) -> Self {
        Self {
            code,
            slot,
            payload,
        }
    }

    /// Escape commands always address slot 0
    pub(crate) const fn escape(payload: Bytes) -> Self {
        Self::new(CommandCode::Escape, 0, payload)
    }

    fn for_probe(probe: &InfoProbe) -> Self {
        match probe {
            InfoProbe::SlotStatus(slot) => Self::new(CommandCode::GetSlotStatus, *slot, Bytes::new()),
            InfoProbe::Escape(payload) => Self::escape(payload.clone()),
        }
    }

    fn power_on(slot: u8) -> Self {
        Self::new(CommandCode::IccPowerOn, slot, Bytes::new())
    }
}

/// Ordered bring-up work of one connection
#[derive(Debug)]
pub(crate) struct Sequencer {
    pending: PendingOperation,
    info: VecDeque<InfoProbe>,
    connect: VecDeque<u8>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::steady()
    }
}

impl Sequencer {
    /// A sequencer with nothing left to do
    pub(crate) fn steady() -> Self {
        Self {
            pending: PendingOperation::Steady,
            info: VecDeque::new(),
            connect: VecDeque::new(),
        }
    }

    /// Queue the bring-up work requested by `config`
    pub(crate) fn new(config: &DeviceConfig) -> Self {
        let info: VecDeque<_> = config.info_probes.iter().cloned().collect();
        let connect: VecDeque<_> = config.auto_connect.iter().copied().collect();
        match &config.secure {
            Some(params) => Self {
                pending: PendingOperation::Authenticate(HostHandshake::new(params.clone())),
                info,
                connect,
            },
            None => Self {
                pending: PendingOperation::ReadInfo(info),
                info: VecDeque::new(),
                connect,
            },
        }
    }

    pub(crate) const fn phase(&self) -> Phase {
        self.pending.phase()
    }

    /// First command of the bring-up, `None` when there is nothing to do at all
    pub(crate) fn start(&mut self) -> Option<OutgoingCommand> {
        match &mut self.pending {
            PendingOperation::Authenticate(handshake) => {
                Some(OutgoingCommand::escape(handshake.authenticate_command()))
            }
            _ => self.next_command(),
        }
    }

    /// The running handshake, if authentication is in progress
    pub(crate) fn handshake_mut(&mut self) -> Option<&mut HostHandshake> {
        match &mut self.pending {
            PendingOperation::Authenticate(handshake) => Some(handshake),
            _ => None,
        }
    }

    /// Authentication succeeded, move on to the info probes
    pub(crate) fn authenticated(&mut self) {
        self.pending = PendingOperation::ReadInfo(mem::take(&mut self.info));
    }

    /// The probe whose response is awaited
    pub(crate) fn current_probe(&self) -> Option<&InfoProbe> {
        match &self.pending {
            PendingOperation::ReadInfo(queue) => queue.front(),
            _ => None,
        }
    }

    /// The slot whose power on is awaited
    pub(crate) fn current_slot(&self) -> Option<u8> {
        match &self.pending {
            PendingOperation::ConnectCards(queue) => queue.front().copied(),
            _ => None,
        }
    }

    /// Drop the item whose response was just handled
    pub(crate) fn advance(&mut self) {
        match &mut self.pending {
            PendingOperation::ReadInfo(queue) => {
                queue.pop_front();
            }
            PendingOperation::ConnectCards(queue) => {
                queue.pop_front();
            }
            PendingOperation::Authenticate(_) | PendingOperation::Steady => {}
        }
    }

    /// Next command to send, moving through the phases as queues run dry
    ///
    /// Returns `None` once the sequencer reached [`Phase::Steady`].
    pub(crate) fn next_command(&mut self) -> Option<OutgoingCommand> {
        loop {
            match &mut self.pending {
                PendingOperation::Authenticate(_) | PendingOperation::Steady => return None,
                PendingOperation::ReadInfo(queue) => match queue.front() {
                    Some(probe) => return Some(OutgoingCommand::for_probe(probe)),
                    None => {
                        debug!("info probes done");
                        self.pending = PendingOperation::ConnectCards(mem::take(&mut self.connect));
                    }
                },
                PendingOperation::ConnectCards(queue) => match queue.front() {
                    Some(&slot) => return Some(OutgoingCommand::power_on(slot)),
                    None => {
                        debug!("auto-connect done");
                        self.pending = PendingOperation::Steady;
                    }
                },
            }
        }
    }
}

impl<T: Transport> Device<T> {
    /// Transport is up: run the first bring-up step
    pub(crate) fn start_bring_up(&mut self) -> Result<()> {
        self.sequencer = Sequencer::new(self.config());
        debug!(id = %self.id(), secure = self.config().is_secure(), "starting bring-up");
        match self.sequencer.start() {
            Some(command) => self.write_command(command),
            None => {
                self.finish_bring_up();
                Ok(())
            }
        }
    }

    fn next_bring_up_step(&mut self) -> Result<()> {
        match self.sequencer.next_command() {
            Some(command) => self.write_command(command),
            None => {
                self.finish_bring_up();
                Ok(())
            }
        }
    }

    fn finish_bring_up(&mut self) {
        debug!(id = %self.id(), "bring-up complete");
        self.set_state(State::Idle);
    }

    /// Feed a response received while authenticating
    pub(crate) fn on_authenticate_response(&mut self, frame: Frame) -> Result<()> {
        let response = frame.response_code()?;
        if response != ResponseCode::Escape {
            return Err(Error::Dialog(format!(
                "unexpected {response} response during authentication"
            )));
        }
        let handshake = self
            .sequencer
            .handshake_mut()
            .ok_or_else(|| Error::Protocol("no authentication in progress".into()))?;

        match handshake.on_response(&frame.payload)? {
            HandshakeProgress::Send(payload) => self.write_command(OutgoingCommand::escape(payload)),
            HandshakeProgress::Established(session) => {
                self.secure = Some(session);
                self.sequencer.authenticated();
                self.next_bring_up_step()
            }
        }
    }

    /// Feed the response to an info probe
    pub(crate) fn on_info_response(&mut self, frame: Frame, sent: InFlight) -> Result<()> {
        let response = frame.response_code()?;
        match (sent.code, response) {
            (CommandCode::Escape, ResponseCode::Escape) => match frame.slot_error() {
                Some(code) => warn!(%code, "info probe failed, skipping it"),
                None => {
                    let request = match self.sequencer.current_probe() {
                        Some(InfoProbe::Escape(request)) => request.clone(),
                        _ => return Err(Error::Protocol("no escape probe in progress".into())),
                    };
                    self.apply_info(&request, &frame.payload)?;
                }
            },
            (CommandCode::GetSlotStatus, ResponseCode::SlotStatus) => {
                match self.slots.get_mut(frame.slot) {
                    Some(slot) => slot.apply_status(frame.status()),
                    None => warn!(slot = frame.slot, "status of an unknown slot"),
                }
                if let Some(code) = frame.slot_error() {
                    warn!(slot = frame.slot, %code, "slot status probe failed");
                }
            }
            (command, response) => {
                return Err(Error::Dialog(format!(
                    "unexpected {response} response to {command} while reading info"
                )));
            }
        }
        self.sequencer.advance();
        self.next_bring_up_step()
    }

    /// Interpret the answer to a CONTROL probe. The first payload byte is the reader's status.
    fn apply_info(&mut self, request: &[u8], response: &[u8]) -> Result<()> {
        let [cla, ins, id, ..] = request else {
            return Err(Error::DummyDevice(format!(
                "Info probe too short: {}",
                hex::encode(request)
            )));
        };
        if *cla != escape::CLA {
            return Err(Error::DummyDevice(format!("Wrong CLA in info probe {cla:02X}")));
        }
        let content = response.get(1..).unwrap_or_default();

        match *ins {
            escape::INS_GET_DATA if *id == escape::ID_FIRMWARE_REVISION => {
                let revision = String::from_utf8(content.to_vec()).map_err(|_| {
                    Error::DummyDevice(format!(
                        "Incorrect firmware revision: {}",
                        hex::encode(content)
                    ))
                })?;
                debug!(%revision, "firmware revision");
                self.info.set_revision(revision)
            }
            escape::INS_GET_DATA => Err(Error::DummyDevice(format!(
                "Wrong identifier in info probe {id:02X}"
            ))),
            escape::INS_GET_SLOT_NAME => {
                let index = *id;
                if index as usize > self.slots.len() {
                    return Err(Error::DummyDevice(format!("Slot number is too much: {index}")));
                }
                let name = String::from_utf8_lossy(content).into_owned();
                debug!(slot = index, %name, "slot name");
                self.info.add_slot_name(&name);
                self.slots.set_name(index, name);
                Ok(())
            }
            other => Err(Error::DummyDevice(format!("Wrong INS in info probe {other:02X}"))),
        }
    }

    /// Feed the response to an auto-connect power on
    ///
    /// Failures only skip the slot; the remaining slots are still powered on.
    pub(crate) fn on_connect_response(&mut self, frame: Frame, sent: InFlight) -> Result<()> {
        let expected = self.sequencer.current_slot();
        if expected != Some(frame.slot) {
            warn!(slot = frame.slot, ?expected, "power on answer for another slot");
        }
        self.sequencer.advance();

        match self.slots.get_mut(frame.slot) {
            None => warn!(slot = frame.slot, "power on answer for an unknown slot"),
            Some(slot) => {
                slot.apply_status(frame.status());
                match (frame.slot_error(), frame.response_code()) {
                    (Some(code), _) => {
                        slot.set_error();
                        warn!(slot = frame.slot, %code, "auto-connect failed");
                    }
                    (None, Ok(ResponseCode::DataBlock)) if sent.code == CommandCode::IccPowerOn => {
                        debug!(slot = frame.slot, atr = %hex::encode(&frame.payload), "card connected");
                        slot.connect(frame.payload.clone());
                    }
                    (None, response) => {
                        warn!(slot = frame.slot, ?response, "unexpected answer to power on");
                    }
                }
            }
        }

        self.next_bring_up_step()
    }
}
