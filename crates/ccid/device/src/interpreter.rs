//! Response interpreter
//!
//! Every complete frame received from the reader goes through [`Device::handle_frame`]:
//! it is opened by the secure session when there is one, matched against the command
//! in flight and routed to the bring-up sequencer or to the steady state dispatch below.

use pcsclike_ccid::{CommandCode, CommandStatus, Frame, ResponseCode};
use tracing::{debug, trace, warn};

use crate::bringup::Phase;
use crate::device::{Device, InFlight};
use crate::error::{Error, Result};
use crate::event::DeviceEvent;
use crate::state::State;
use crate::transport::Transport;

impl<T: Transport> Device<T> {
    /// Handle one complete frame from the response channel
    pub(crate) fn handle_frame(&mut self, raw: &[u8]) {
        trace!(id = %self.id(), frame = %hex::encode(raw), "RDR_to_PC");

        let state = self.state();
        if !matches!(state, State::Creating | State::WritingCmdAndWaitingResp) {
            warn!(id = %self.id(), %state, "unexpected frame, dropping it");
            return;
        }
        let Some(sent) = self.in_flight() else {
            warn!(id = %self.id(), "no command in flight, dropping frame");
            return;
        };

        let frame = match self.decode_response(raw) {
            Ok(frame) => frame,
            Err(err) => return self.on_communication_error(err),
        };
        if frame.seq != sent.seq {
            warn!(expected = sent.seq, received = frame.seq, "sequence number mismatch");
        }
        if frame.status().command() == CommandStatus::TimeExtension {
            debug!(seq = frame.seq, "time extension requested, still waiting");
            return;
        }
        self.take_in_flight();

        let outcome = match self.phase() {
            Phase::Authenticate => self.on_authenticate_response(frame),
            Phase::ReadInfo => self.on_info_response(frame, sent),
            Phase::ConnectCards => self.on_connect_response(frame, sent),
            Phase::Steady => self.interpret(frame, sent),
        };
        if let Err(err) = outcome {
            self.on_communication_error(err);
        }
    }

    fn decode_response(&mut self, raw: &[u8]) -> Result<Frame> {
        match self.secure.as_mut() {
            Some(session) => Ok(session.open_bytes(raw)?),
            None => Ok(Frame::decode(raw)?),
        }
    }

    /// Interpret the response to a command sent by the application or by auto-connect
    fn interpret(&mut self, frame: Frame, sent: InFlight) -> Result<()> {
        let response = frame.response_code().map_err(|_| {
            Error::Dialog(format!(
                "Unknown CCID response ({:02X}) for command: {}",
                frame.code, sent.code
            ))
        })?;
        let index = frame.slot;
        let auto_connect =
            sent.code == CommandCode::IccPowerOn && self.auto_connect_in_flight.take() == Some(index);

        let carries_status = matches!(response, ResponseCode::DataBlock | ResponseCode::SlotStatus);
        if carries_status {
            let count = self.slots.len();
            let slot = self.slots.get_mut(index).ok_or_else(|| {
                Error::Protocol(format!(
                    "Slot number {index} greater than maximum slot ({count}), maybe the packet is incorrect"
                ))
            })?;
            slot.apply_status(frame.status());
        }

        if let Some(code) = frame.slot_error() {
            debug!(slot = index, %code, "slot error, not processing the frame");
            if carries_status {
                if let Some(slot) = self.slots.get_mut(index) {
                    slot.set_error();
                }
            }
            self.emit(DeviceEvent::ReaderOrCardError {
                slot: index,
                error: Error::Slot { slot: index, code },
            });
            self.set_state(State::Idle);
            return Ok(());
        }

        let event = match (response, sent.code) {
            (ResponseCode::Escape, CommandCode::Escape) => DeviceEvent::ControlResponse {
                response: frame.payload,
            },
            (ResponseCode::DataBlock, CommandCode::XfrBlock) => DeviceEvent::TransmitResponse {
                slot: index,
                response: frame.payload,
            },
            (ResponseCode::DataBlock | ResponseCode::SlotStatus, CommandCode::IccPowerOn) => {
                self.card_connected(index, frame, auto_connect)
            }
            (ResponseCode::SlotStatus, CommandCode::GetSlotStatus) => self.reader_status(index),
            (ResponseCode::SlotStatus, CommandCode::IccPowerOff) => {
                if let Some(slot) = self.slots.get_mut(index) {
                    slot.disconnect();
                }
                DeviceEvent::CardDisconnected { slot: index }
            }
            (ResponseCode::SlotStatus, CommandCode::XfrBlock) => {
                let unpowered = self
                    .slots
                    .get(index)
                    .is_some_and(|slot| slot.card_present() && !slot.card_powered());
                let reason = if unpowered {
                    "Transmit invoked, but card not powered"
                } else {
                    "Transmit invoked, but the card returned no data"
                };
                DeviceEvent::ReaderOrCardError {
                    slot: index,
                    error: Error::CardCommunication(reason.into()),
                }
            }
            (response, command) => {
                return Err(Error::Dialog(format!(
                    "Unexpected CCID response ({response}) for command: {command}"
                )));
            }
        };

        self.emit(event);
        self.set_state(State::Idle);
        Ok(())
    }

    /// A power on answer: record the ATR and report the card
    ///
    /// Auto-connected cards are reported as a reader status change, like the insertion
    /// that triggered them.
    fn card_connected(&mut self, index: u8, frame: Frame, auto_connect: bool) -> DeviceEvent {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.connect(frame.payload.clone());
        }
        debug!(slot = index, atr = %hex::encode(&frame.payload), auto_connect, "card connected");
        if auto_connect {
            self.reader_status(index)
        } else {
            DeviceEvent::CardConnected {
                slot: index,
                atr: frame.payload,
            }
        }
    }

    fn reader_status(&self, index: u8) -> DeviceEvent {
        DeviceEvent::ReaderStatus {
            slot: index,
            present: self.slots.check_presence(index),
            connected: self.slots.is_connected(index),
        }
    }
}
