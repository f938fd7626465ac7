//! Channel-based event handling

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::trace;

use crate::event::{DeviceEvent, DeviceEventHandler};

/// Sender for device events
pub type DeviceEventSender = Sender<DeviceEvent>;
/// Receiver for device events
pub type DeviceEventReceiver = Receiver<DeviceEvent>;

/// Create an unbounded channel for device events
pub fn device_event_channel() -> (DeviceEventSender, DeviceEventReceiver) {
    unbounded()
}

/// Create a bounded channel with the specified capacity for device events
pub fn bounded_device_event_channel(capacity: usize) -> (DeviceEventSender, DeviceEventReceiver) {
    bounded(capacity)
}

/// Handler forwarding every event into a channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: DeviceEventSender,
}

impl ChannelHandler {
    /// Forward events to `sender`
    pub const fn new(sender: DeviceEventSender) -> Self {
        Self { sender }
    }
}

impl DeviceEventHandler for ChannelHandler {
    fn handle_event(&mut self, event: DeviceEvent) {
        if self.sender.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}
