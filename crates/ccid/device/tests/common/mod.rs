//! Helpers shared by the device integration tests
#![allow(dead_code)]

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use pcsclike_device::sim::{self, SimHandle, SimTransport, SimulatedReader};
use pcsclike_device::{Device, DeviceConfig, DeviceEvent, KeyIndex, SecureParameters, TransportEvent};

pub const ATR: [u8; 5] = [0x3B, 0x80, 0x80, 0x01, 0x01];

pub const KEY: [u8; 16] = hex_literal::hex!("E7AE3D8A6F5A4C1B2C3D4E5F60718293");

pub type Events = Arc<Mutex<Vec<DeviceEvent>>>;

pub struct Harness {
    pub device: Device<SimTransport>,
    pub handle: SimHandle,
    pub link: Receiver<TransportEvent>,
    pub events: Events,
}

impl Harness {
    pub fn new(reader: SimulatedReader, config: DeviceConfig) -> Self {
        let (transport, handle, link) = sim::link(reader);
        let events = Events::default();
        let sink = events.clone();
        let device = Device::new("sim", transport, config)
            .with_handler(move |event| sink.lock().push(event));
        Self {
            device,
            handle,
            link,
            events,
        }
    }

    /// Connect and run the bring-up to completion
    pub fn connect(&mut self) {
        self.device.connect().unwrap();
        self.pump();
    }

    pub fn pump(&mut self) -> usize {
        sim::pump(&mut self.device, &self.link)
    }

    pub fn take_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, matches: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| matches(event)).count()
    }
}

pub fn secure(key: [u8; 16]) -> SecureParameters {
    SecureParameters::new(KeyIndex::User, key)
}
