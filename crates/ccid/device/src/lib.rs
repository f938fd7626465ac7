//! Connection lifecycle for CCID smart card readers over USB or BLE
//!
//! A [`Device`] sits between an injected byte [`Transport`] and the application. It runs
//! the bring-up once the link is up (mutual authentication, info probes, card
//! auto-connect), then serializes the application's commands one at a time and reports
//! what happens as [`DeviceEvent`]s.
//!
//! # Features
//!
//! - `std` (default): standard library support
//!
//! # Examples
//!
//! ```
//! use pcsclike_device::sim::{self, SimCard, SimulatedReader};
//! use pcsclike_device::{Device, DeviceConfig, State};
//!
//! let reader = SimulatedReader::new()
//!     .with_slot("Contactless")
//!     .with_card(SimCard::new(vec![0x3B, 0x80, 0x80, 0x01, 0x01]));
//! let (transport, _handle, link) = sim::link(reader);
//!
//! let config = DeviceConfig::new()
//!     .with_slot_name_probe(0)
//!     .with_auto_connect(0);
//! let mut device = Device::new("sim", transport, config);
//!
//! device.connect().unwrap();
//! sim::pump(&mut device, &link);
//!
//! assert_eq!(device.state(), State::Idle);
//! assert_eq!(device.slot(0).unwrap().name(), "Contactless");
//! assert!(device.is_connected(0));
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod bringup;
mod config;
mod device;
mod error;
pub mod event;
mod info;
mod interpreter;
mod registry;
mod slot;
mod state;
mod transport;

pub mod blocking;
pub mod sim;

pub use bringup::Phase;
pub use blocking::BlockingDevice;
pub use config::{DeviceConfig, InfoProbe, KeyIndex, SecureParameters, Timeouts};
pub use device::Device;
pub use error::{Error, Result};
pub use event::{ChannelHandler, DeviceEvent, DeviceEventHandler, IgnoreEvents};
pub use info::{DeviceInfo, FirmwareVersion};
pub use registry::DeviceRegistry;
pub use slot::{Channel, Slot, SlotRegistry};
pub use state::{Effect, InvalidTransition, State, StateMachine, Transition, is_allowed};
pub use transport::{Transport, TransportError, TransportEvent};

// Re-export the wire level crate
pub use pcsclike_ccid as ccid;
