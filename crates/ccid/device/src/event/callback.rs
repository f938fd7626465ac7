//! Callback-based event handling

use crate::event::DeviceEvent;

/// Trait for handling device events
pub trait DeviceEventHandler {
    /// Handle a device event
    fn handle_event(&mut self, event: DeviceEvent);
}

// Implement handlers for closures
impl<F> DeviceEventHandler for F
where
    F: FnMut(DeviceEvent),
{
    fn handle_event(&mut self, event: DeviceEvent) {
        self(event)
    }
}

/// Handler dropping every event
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreEvents;

impl DeviceEventHandler for IgnoreEvents {
    fn handle_event(&mut self, _event: DeviceEvent) {}
}
