//! Blocking wrapper around a [`Device`]
//!
//! A background thread feeds transport events to the device while the caller waits,
//! with a bound, for the event answering its request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::Timeouts;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::event::{ChannelHandler, DeviceEvent, DeviceEventReceiver, device_event_channel};
use crate::state::State;
use crate::transport::{Transport, TransportEvent};

/// How often the pump thread checks whether it should stop
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Pause before retrying a command rejected because another one is in flight
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// A device driven with blocking calls
pub struct BlockingDevice<T: Transport + 'static> {
    device: Arc<Mutex<Device<T>>>,
    events: DeviceEventReceiver,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    timeouts: Timeouts,
}

impl<T: Transport + 'static> std::fmt::Debug for BlockingDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingDevice")
            .field("device", &self.device)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> BlockingDevice<T> {
    /// Take over `device`, whose transport reports through `transport_events`
    ///
    /// Any event handler already installed on the device is replaced.
    pub fn new(device: Device<T>, transport_events: Receiver<TransportEvent>) -> Self {
        let (sender, events) = device_event_channel();
        let timeouts = device.config().timeouts;
        let device = Arc::new(Mutex::new(device.with_handler(ChannelHandler::new(sender))));
        let running = Arc::new(AtomicBool::new(true));

        let pump = {
            let device = Arc::clone(&device);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    match transport_events.recv_timeout(PUMP_INTERVAL) {
                        Ok(event) => device.lock().handle_transport_event(event),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                trace!("transport pump stopped");
            })
        };

        Self {
            device,
            events,
            running,
            pump: Some(pump),
            timeouts,
        }
    }

    /// Lock the device, e.g. to read its slots
    pub fn device(&self) -> MutexGuard<'_, Device<T>> {
        self.device.lock()
    }

    /// Connect and wait for the bring-up to complete
    pub fn create(&self) -> Result<()> {
        self.drain();
        self.device.lock().connect()?;
        let deadline = Instant::now() + self.timeouts.create;
        loop {
            let event = match self.next_event(deadline) {
                Ok(event) => event,
                Err(err) => {
                    debug!("bring-up timed out, disconnecting");
                    if let Err(err) = self.device.lock().disconnect() {
                        warn!(%err, "disconnect after bring-up timeout failed");
                    }
                    return Err(err);
                }
            };
            match event {
                DeviceEvent::Created => return Ok(()),
                DeviceEvent::Error(err) => return Err(err),
                DeviceEvent::Closed { .. } => {
                    let last_error = self.device.lock().last_error().cloned();
                    return Err(last_error.unwrap_or(Error::DeviceNotConnected));
                }
                _ => {}
            }
        }
    }

    /// Power on the card in `slot` and return its ATR
    pub fn connect_card(&self, slot: u8) -> Result<Bytes> {
        self.run(
            self.timeouts.card_connect,
            |device| device.connect_card(slot),
            |event| match event {
                DeviceEvent::CardConnected { slot: s, atr } if s == slot => Some(Ok(atr)),
                DeviceEvent::ReaderOrCardError { slot: s, error } if s == slot => Some(Err(error)),
                _ => None,
            },
        )
    }

    /// Power off the card in `slot`
    pub fn disconnect_card(&self, slot: u8) -> Result<()> {
        self.run(
            self.timeouts.card_connect,
            |device| device.disconnect_card(slot),
            |event| match event {
                DeviceEvent::CardDisconnected { slot: s } if s == slot => Some(Ok(())),
                DeviceEvent::ReaderOrCardError { slot: s, error } if s == slot => Some(Err(error)),
                _ => None,
            },
        )
    }

    /// Exchange an APDU with the card in `slot`
    pub fn transmit(&self, slot: u8, apdu: impl Into<Bytes>) -> Result<Bytes> {
        let apdu = apdu.into();
        self.run(
            self.timeouts.response,
            |device| device.transmit(slot, apdu.clone()),
            |event| match event {
                DeviceEvent::TransmitResponse { slot: s, response } if s == slot => Some(Ok(response)),
                DeviceEvent::ReaderOrCardError { slot: s, error } if s == slot => Some(Err(error)),
                _ => None,
            },
        )
    }

    /// Exchange an escape command with the reader
    pub fn control(&self, payload: impl Into<Bytes>) -> Result<Bytes> {
        let payload = payload.into();
        self.run(
            self.timeouts.response,
            |device| device.control(payload.clone()),
            |event| match event {
                DeviceEvent::ControlResponse { response } => Some(Ok(response)),
                DeviceEvent::ReaderOrCardError { error, .. } => Some(Err(error)),
                _ => None,
            },
        )
    }

    /// Wait until a card sits in `slot`
    pub fn wait_for_card_present(&self, slot: u8, timeout: Duration) -> Result<()> {
        self.wait_for_presence(slot, true, timeout)
    }

    /// Wait until `slot` is empty
    pub fn wait_for_card_absent(&self, slot: u8, timeout: Duration) -> Result<()> {
        self.wait_for_presence(slot, false, timeout)
    }

    /// Disconnect and wait for the device to reach `Closed`
    pub fn close(&self) -> Result<()> {
        self.device.lock().disconnect()?;
        let deadline = Instant::now() + self.timeouts.response;
        loop {
            if self.device.lock().state() == State::Closed {
                return Ok(());
            }
            if let DeviceEvent::Closed { .. } = self.next_event(deadline)? {
                return Ok(());
            }
        }
    }

    fn wait_for_presence(&self, slot: u8, present: bool, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let device = self.device.lock();
                if device.state() == State::Closed {
                    return Err(Error::DeviceNotConnected);
                }
                if device.check_presence(slot) == present {
                    return Ok(());
                }
            }
            if let DeviceEvent::Closed { .. } = self.next_event(deadline)? {
                return Err(Error::DeviceNotConnected);
            }
        }
    }

    /// Send a command, then wait for the event that answers it
    ///
    /// A command rejected because another one (e.g. an auto-connect) is in flight is
    /// retried until the deadline.
    fn run<R>(
        &self,
        timeout: Duration,
        mut send: impl FnMut(&mut Device<T>) -> Result<()>,
        mut accept: impl FnMut(DeviceEvent) -> Option<Result<R>>,
    ) -> Result<R> {
        let deadline = Instant::now() + timeout;
        self.drain();

        loop {
            let (result, state) = {
                let mut device = self.device.lock();
                (send(&mut device), device.state())
            };
            match result {
                Ok(()) => break,
                Err(Error::Busy(reason))
                    if matches!(state, State::Idle | State::WritingCmdAndWaitingResp) =>
                {
                    trace!(reason, "device busy, retrying");
                    let wait = RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
                    if wait.is_zero() {
                        return Err(Error::Timeout);
                    }
                    match self.events.recv_timeout(wait) {
                        Ok(DeviceEvent::Closed { .. }) => return Err(Error::DeviceNotConnected),
                        Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
                    }
                }
                Err(err) => return Err(err),
            }
        }

        loop {
            match self.next_event(deadline)? {
                DeviceEvent::Error(err) => return Err(err),
                DeviceEvent::Closed { .. } => return Err(Error::DeviceNotConnected),
                event => {
                    if let Some(result) = accept(event) {
                        return result;
                    }
                }
            }
        }
    }

    fn next_event(&self, deadline: Instant) -> Result<DeviceEvent> {
        self.events.recv_deadline(deadline).map_err(|_| Error::Timeout)
    }

    /// Forget events nobody waited for
    fn drain(&self) {
        while let Ok(event) = self.events.try_recv() {
            trace!(?event, "discarding stale event");
        }
    }
}

impl<T: Transport + 'static> Drop for BlockingDevice<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}
