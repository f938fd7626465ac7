//! One reader device and its connection lifecycle
//!
//! [`Device`] owns everything about a connection: lifecycle state, slots, sequence
//! counter, secure session and bring-up queues. It is driven from two sides:
//!
//! - the application, through [`Device::connect`], [`Device::transmit`] and friends
//! - the transport, through [`Device::handle_transport_event`] or the `on_*` methods
//!
//! Every call runs to completion before returning. Events raised along the way are
//! queued and handed to the [`DeviceEventHandler`] once the call is done.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use pcsclike_ccid::{CommandCode, CommandEncoder, FrameAssembler, SecureSession, decode_slot_change};
use tracing::{debug, error, trace, warn};

use crate::bringup::{OutgoingCommand, Phase, Sequencer};
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::event::{DeviceEvent, DeviceEventHandler, IgnoreEvents};
use crate::info::DeviceInfo;
use crate::registry::DeviceRegistry;
use crate::slot::{Slot, SlotRegistry};
use crate::state::{Effect, State, StateMachine};
use crate::transport::{Transport, TransportEvent};

/// The command waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InFlight {
    pub(crate) code: CommandCode,
    pub(crate) slot: u8,
    pub(crate) seq: u8,
}

/// A multi-slot reader reached through a [`Transport`]
pub struct Device<T: Transport> {
    id: String,
    config: DeviceConfig,
    transport: T,
    machine: StateMachine,
    pub(crate) slots: SlotRegistry,
    pub(crate) info: DeviceInfo,
    encoder: CommandEncoder,
    assembler: FrameAssembler,
    pub(crate) secure: Option<SecureSession>,
    pub(crate) sequencer: Sequencer,
    in_flight: Option<InFlight>,
    pub(crate) auto_connect_in_flight: Option<u8>,
    last_error: Option<Error>,
    registry: Option<DeviceRegistry>,
    handler: Box<dyn DeviceEventHandler + Send>,
    events: VecDeque<DeviceEvent>,
}

impl<T: Transport> fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.machine.state())
            .field("phase", &self.sequencer.phase())
            .field("transport", &self.transport)
            .field("slots", &self.slots)
            .field("in_flight", &self.in_flight)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Device<T> {
    /// Create a closed device. Events are dropped until a handler is installed.
    pub fn new(id: impl Into<String>, transport: T, config: DeviceConfig) -> Self {
        Self {
            id: id.into(),
            slots: SlotRegistry::with_count(config.slot_count),
            config,
            transport,
            machine: StateMachine::new(),
            info: DeviceInfo::default(),
            encoder: CommandEncoder::new(),
            assembler: FrameAssembler::new(),
            secure: None,
            sequencer: Sequencer::steady(),
            in_flight: None,
            auto_connect_in_flight: None,
            last_error: None,
            registry: None,
            handler: Box::new(IgnoreEvents),
            events: VecDeque::new(),
        }
    }

    /// Deliver events to `handler`
    pub fn with_handler(mut self, handler: impl DeviceEventHandler + Send + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Record the device in `registry` while it is connected
    pub fn with_registry(mut self, registry: DeviceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Device identifier used in logs and in the registry
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration the device was created with
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Current lifecycle state
    pub const fn state(&self) -> State {
        self.machine.state()
    }

    /// Current bring-up phase
    pub const fn phase(&self) -> Phase {
        self.sequencer.phase()
    }

    /// Whether the secure channel is established
    pub const fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// Information read during bring-up
    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Error that caused the last teardown, kept until the next [`Device::connect`]
    pub const fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// All slots
    pub const fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    /// One slot
    pub fn slot(&self, index: u8) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// A card is present in the slot
    pub fn check_presence(&self, index: u8) -> bool {
        self.slots.check_presence(index)
    }

    /// The card in the slot is powered and its ATR known
    pub fn is_connected(&self, index: u8) -> bool {
        self.slots.is_connected(index)
    }

    /// ATR of the connected card in the slot
    pub fn atr(&self, index: u8) -> Option<Bytes> {
        self.slots.atr(index)
    }

    /// Underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // Application side

    /// Open the transport and start the bring-up once it reports connected
    pub fn connect(&mut self) -> Result<()> {
        let result = self.open_connection();
        self.flush_events();
        result
    }

    fn open_connection(&mut self) -> Result<()> {
        if self.state() != State::Closed {
            return Err(Error::Busy("device is already connected"));
        }
        self.last_error = None;
        self.set_state(State::Creating);

        if let Err(err) = self.transport.connect() {
            error!(id = %self.id, %err, "transport failed to connect");
            let err = Error::from(err);
            self.last_error = Some(err.clone());
            self.set_state(State::Closing);
            self.set_state(State::Closed);
            return Err(err);
        }
        Ok(())
    }

    /// Close the connection
    ///
    /// A command or bring-up still outstanding is failed with
    /// [`Error::DeviceNotConnected`]. The device reaches `Closed` once the transport
    /// reports the link down.
    pub fn disconnect(&mut self) -> Result<()> {
        let result = self.close_connection();
        self.flush_events();
        result
    }

    fn close_connection(&mut self) -> Result<()> {
        match self.state() {
            State::Closed | State::Closing => return Ok(()),
            State::Creating | State::WakingUp | State::WritingCmdAndWaitingResp => {
                if self.last_error.is_none() {
                    self.last_error = Some(Error::DeviceNotConnected);
                }
            }
            State::Idle | State::Sleeping => {}
        }
        self.set_state(State::Closing);

        if let Err(err) = self.transport.disconnect() {
            warn!(id = %self.id, %err, "transport failed to disconnect, closing anyway");
            self.set_state(State::Closed);
            return Err(err.into());
        }
        Ok(())
    }

    /// Ask a sleeping device to leave low power mode
    pub fn wake_up(&mut self) -> Result<()> {
        let result = self.request_wake_up();
        self.flush_events();
        result
    }

    fn request_wake_up(&mut self) -> Result<()> {
        match self.state() {
            State::Idle => return Ok(()),
            State::Sleeping => {}
            _ => return self.ensure_ready(),
        }
        self.set_state(State::WakingUp);
        if let Err(err) = self.transport.wake_up() {
            warn!(id = %self.id, %err, "wake up failed");
            self.set_state(State::Sleeping);
            return Err(err.into());
        }
        Ok(())
    }

    /// Send an APDU to the card in `slot`
    pub fn transmit(&mut self, slot: u8, apdu: impl Into<Bytes>) -> Result<()> {
        self.slot_command(CommandCode::XfrBlock, slot, apdu.into())
    }

    /// Power on the card in `slot`
    pub fn connect_card(&mut self, slot: u8) -> Result<()> {
        self.slot_command(CommandCode::IccPowerOn, slot, Bytes::new())
    }

    /// Power off the card in `slot`
    pub fn disconnect_card(&mut self, slot: u8) -> Result<()> {
        self.slot_command(CommandCode::IccPowerOff, slot, Bytes::new())
    }

    /// Ask the reader for the status of `slot`
    pub fn get_slot_status(&mut self, slot: u8) -> Result<()> {
        self.slot_command(CommandCode::GetSlotStatus, slot, Bytes::new())
    }

    /// Send an escape command to the reader itself
    pub fn control(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let result = self.submit(OutgoingCommand::escape(payload.into()));
        self.flush_events();
        result
    }

    fn slot_command(&mut self, code: CommandCode, slot: u8, payload: Bytes) -> Result<()> {
        let result = self.ensure_ready().and_then(|()| {
            if self.slots.get(slot).is_none() {
                return Err(Error::NoSuchSlot(slot));
            }
            self.submit(OutgoingCommand::new(code, slot, payload))
        });
        self.flush_events();
        result
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            State::Idle => Ok(()),
            State::Sleeping | State::WakingUp => Err(Error::Busy("device is sleeping")),
            State::WritingCmdAndWaitingResp => Err(Error::Busy("a command is already in flight")),
            State::Creating => Err(Error::Busy("device is being created")),
            State::Closed | State::Closing => Err(Error::Closed),
        }
    }

    /// Take the exclusive token and send a steady state command
    pub(crate) fn submit(&mut self, command: OutgoingCommand) -> Result<()> {
        self.ensure_ready()?;
        self.set_state(State::WritingCmdAndWaitingResp);
        if let Err(err) = self.write_command(command) {
            self.on_communication_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Frame, protect and write a command
    pub(crate) fn write_command(&mut self, command: OutgoingCommand) -> Result<()> {
        let frame = self
            .encoder
            .encode_command(command.code, command.slot, command.payload);
        trace!(id = %self.id, frame = %hex::encode(frame.encode()), "PC_to_RDR");

        let raw = match self.secure.as_mut() {
            Some(session) => session.seal_bytes(&frame)?,
            None => frame.encode(),
        };
        self.in_flight = Some(InFlight {
            code: command.code,
            slot: command.slot,
            seq: frame.seq,
        });
        self.transport.write(&raw)?;
        Ok(())
    }

    // Transport side

    /// Dispatch an event reported by the transport
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Data(data) => self.on_data_received(&data),
            TransportEvent::Status(data) => self.on_status_received(&data),
            TransportEvent::SleepState(sleeping) => self.on_sleep_state_changed(sleeping),
        }
    }

    /// The link is up
    pub fn on_connected(&mut self) {
        if self.state() != State::Creating {
            warn!(id = %self.id, state = %self.state(), "unexpected connection, ignoring");
            return;
        }
        if let Err(err) = self.start_bring_up() {
            self.on_communication_error(err);
        }
        self.flush_events();
    }

    /// The link is down
    pub fn on_disconnected(&mut self) {
        match self.state() {
            State::Closed => warn!(id = %self.id, "device already closed"),
            State::Idle | State::Sleeping => {
                self.set_state(State::Closing);
                self.set_state(State::Closed);
            }
            State::Creating | State::WakingUp | State::WritingCmdAndWaitingResp => {
                self.last_error = Some(Error::DeviceNotConnected);
                self.set_state(State::Closing);
                self.set_state(State::Closed);
            }
            State::Closing => self.set_state(State::Closed),
        }
        self.flush_events();
    }

    /// Bytes arrived on the response channel
    pub fn on_data_received(&mut self, data: &[u8]) {
        if matches!(self.state(), State::Closed | State::Closing) {
            debug!(id = %self.id, len = data.len(), "dropping data received while closed");
            return;
        }
        self.assembler.push(data);
        loop {
            match self.assembler.next_frame() {
                Ok(Some(raw)) => self.handle_frame(&raw),
                Ok(None) => break,
                Err(err) => {
                    self.on_communication_error(err.into());
                    break;
                }
            }
            if matches!(self.state(), State::Closed | State::Closing) {
                break;
            }
        }
        self.flush_events();
    }

    /// Bytes arrived on the status channel
    pub fn on_status_received(&mut self, data: &[u8]) {
        if matches!(self.state(), State::Closed | State::Closing) {
            debug!(id = %self.id, "dropping status received while closed");
            return;
        }
        let changes = match decode_slot_change(data, self.slots.len()) {
            Ok(changes) => changes,
            Err(err) => {
                self.on_communication_error(err.into());
                self.flush_events();
                return;
            }
        };

        let notify = self.state() != State::Creating;
        for change in changes {
            let Some(slot) = self.slots.get_mut(change.slot) else {
                continue;
            };
            if !change.changed && slot.card_present() == change.present {
                continue;
            }
            slot.apply_presence(change.present);
            debug!(slot = change.slot, present = change.present, "slot changed");
            if notify {
                let event = DeviceEvent::ReaderStatus {
                    slot: change.slot,
                    present: slot.card_present(),
                    connected: slot.card_connected(),
                };
                self.emit(event);
            }
        }
        if notify {
            self.may_connect_card();
        }
        self.flush_events();
    }

    /// The device entered (`true`) or left (`false`) low power mode
    pub fn on_sleep_state_changed(&mut self, sleeping: bool) {
        if sleeping {
            self.set_state(State::Sleeping);
        } else if matches!(self.state(), State::Sleeping | State::WakingUp) {
            self.set_state(State::Idle);
        } else {
            debug!(id = %self.id, state = %self.state(), "device already awake");
        }
        self.flush_events();
    }

    /// Fatal error on the connection: remember it and tear the link down
    pub(crate) fn on_communication_error(&mut self, err: Error) {
        error!(id = %self.id, %err, "communication error");
        self.last_error = Some(err.clone());
        if self.state() == State::Idle {
            // leaving Idle does not report errors by itself
            self.emit(DeviceEvent::Error(err));
        }
        // a failing transport still ends in Closed
        if let Err(err) = self.close_connection() {
            warn!(id = %self.id, %err, "teardown after communication error failed");
        }
    }

    // Internals

    pub(crate) const fn in_flight(&self) -> Option<InFlight> {
        self.in_flight
    }

    pub(crate) fn take_in_flight(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    pub(crate) fn emit(&mut self, event: DeviceEvent) {
        trace!(id = %self.id, ?event, "queueing event");
        self.events.push_back(event);
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.events.pop_front() {
            self.handler.handle_event(event);
        }
    }

    /// Move to `to` and apply what the transition implies
    ///
    /// Rejected transitions are logged by the state machine and leave everything unchanged.
    pub(crate) fn set_state(&mut self, to: State) {
        let Ok(transition) = self.machine.transition(to) else {
            return;
        };
        match transition.effect {
            Effect::None => {}
            Effect::Created => {
                if let Some(registry) = &self.registry {
                    registry.insert(&self.id, self.info.clone());
                }
                self.emit(DeviceEvent::Created);
            }
            Effect::PowerState => self.emit(DeviceEvent::PowerState {
                low_power: to == State::Sleeping,
            }),
            Effect::DeviceError => {
                if let Some(err) = self.last_error.clone() {
                    self.emit(DeviceEvent::Error(err));
                }
            }
            Effect::Closed { created } => {
                if let Some(registry) = &self.registry {
                    registry.remove(&self.id);
                }
                self.reset_session();
                self.emit(DeviceEvent::Closed { created });
            }
        }

        if to == State::Idle {
            self.may_connect_card();
        }
    }

    /// Power on the first auto-connect slot holding an unconnected card
    pub(crate) fn may_connect_card(&mut self) {
        if self.state() != State::Idle || self.auto_connect_in_flight.is_some() {
            return;
        }
        let candidate = self.config.auto_connect.iter().copied().find(|&index| {
            self.slots.get(index).is_some_and(|slot| {
                slot.card_present() && !slot.card_connected() && !slot.card_error()
            })
        });
        let Some(slot) = candidate else {
            return;
        };

        debug!(id = %self.id, slot, "auto-connecting card");
        self.auto_connect_in_flight = Some(slot);
        if let Err(err) = self.submit(OutgoingCommand::new(CommandCode::IccPowerOn, slot, Bytes::new())) {
            warn!(id = %self.id, slot, %err, "auto-connect failed");
        }
    }

    /// Drop everything tied to the connection that just closed
    fn reset_session(&mut self) {
        self.slots = SlotRegistry::with_count(self.config.slot_count);
        self.info = DeviceInfo::default();
        self.secure = None;
        self.sequencer = Sequencer::steady();
        self.encoder.reset();
        self.assembler.clear();
        self.in_flight = None;
        self.auto_connect_in_flight = None;
    }
}
