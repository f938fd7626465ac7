//! Lifecycle of a device driven by hand against the simulated reader

mod common;

use common::{ATR, Harness};
use pcsclike_device::sim::{SimCard, SimulatedReader};
use pcsclike_device::{DeviceConfig, DeviceEvent, Error, State};

fn one_slot(card: bool) -> Harness {
    let mut reader = SimulatedReader::new().with_slot("Contactless");
    if card {
        reader = reader.with_card(SimCard::new(ATR.to_vec()));
    }
    Harness::new(reader, DeviceConfig::new().with_slot_count(1).with_slot_status_probe(0))
}

fn closed_events(harness: &Harness) -> usize {
    harness.count(|event| matches!(event, DeviceEvent::Closed { .. }))
}

#[test]
fn command_cycles_between_idle_and_writing() {
    let mut harness = one_slot(true);
    harness.connect();
    assert_eq!(harness.device.state(), State::Idle);
    assert!(harness.device.check_presence(0));

    harness.device.connect_card(0).unwrap();
    assert_eq!(harness.device.state(), State::WritingCmdAndWaitingResp);
    assert!(matches!(
        harness.device.transmit(0, vec![0x00, 0xA4, 0x04, 0x00]),
        Err(Error::Busy(_))
    ));
    harness.pump();
    assert_eq!(harness.device.state(), State::Idle);

    harness.device.get_slot_status(0).unwrap();
    harness.pump();
    assert_eq!(harness.device.state(), State::Idle);

    let events = harness.take_events();
    assert_eq!(
        events[1..],
        [
            DeviceEvent::CardConnected {
                slot: 0,
                atr: ATR.to_vec().into()
            },
            DeviceEvent::ReaderStatus {
                slot: 0,
                present: true,
                connected: true
            },
        ]
    );
}

#[test]
fn disconnect_while_creating() {
    let mut harness = one_slot(true);
    harness.device.connect().unwrap();
    assert_eq!(harness.device.state(), State::Creating);

    harness.device.disconnect().unwrap();
    harness.pump();

    assert_eq!(harness.device.state(), State::Closed);
    assert_eq!(
        harness.take_events(),
        vec![
            DeviceEvent::Error(Error::DeviceNotConnected),
            DeviceEvent::Closed { created: false }
        ]
    );
}

#[test]
fn disconnect_while_idle() {
    let mut harness = one_slot(true);
    harness.connect();
    harness.device.disconnect().unwrap();
    harness.pump();
    // a second request changes nothing
    harness.device.disconnect().unwrap();
    harness.pump();

    assert_eq!(harness.device.state(), State::Closed);
    assert_eq!(harness.device.last_error(), None);
    assert_eq!(
        harness.take_events(),
        vec![DeviceEvent::Created, DeviceEvent::Closed { created: true }]
    );
}

#[test]
fn disconnect_while_writing() {
    let mut harness = one_slot(true);
    harness.connect();
    harness.device.transmit(0, vec![0x00, 0xCA, 0x00, 0x00]).unwrap();
    harness.device.disconnect().unwrap();
    harness.pump();

    assert_eq!(harness.device.state(), State::Closed);
    assert_eq!(harness.device.last_error(), Some(&Error::DeviceNotConnected));
    assert_eq!(
        harness.take_events(),
        vec![
            DeviceEvent::Created,
            DeviceEvent::Error(Error::DeviceNotConnected),
            DeviceEvent::Closed { created: true }
        ]
    );
}

#[test]
fn disconnect_while_sleeping() {
    let mut harness = one_slot(true);
    harness.connect();
    harness.handle.sleep();
    harness.pump();
    assert_eq!(harness.device.state(), State::Sleeping);

    harness.device.disconnect().unwrap();
    harness.pump();
    assert_eq!(harness.device.state(), State::Closed);
    assert_eq!(closed_events(&harness), 1);
}

#[test]
fn link_loss_fails_the_command_in_flight() {
    let mut harness = one_slot(true);
    harness.connect();
    harness.handle.reader().set_unresponsive(true);

    harness.device.transmit(0, vec![0x00, 0xB0, 0x00, 0x00]).unwrap();
    harness.pump();
    assert_eq!(harness.device.state(), State::WritingCmdAndWaitingResp);

    harness.handle.drop_link();
    harness.pump();
    assert_eq!(harness.device.state(), State::Closed);
    assert_eq!(harness.device.last_error(), Some(&Error::DeviceNotConnected));
    assert!(
        harness
            .take_events()
            .ends_with(&[DeviceEvent::Error(Error::DeviceNotConnected), DeviceEvent::Closed { created: true }])
    );
}

#[test]
fn inserted_card_is_connected_automatically() {
    let reader = SimulatedReader::new().with_slot("Contactless");
    let config = DeviceConfig::new().with_slot_count(1).with_auto_connect(0);
    let mut harness = Harness::new(reader, config);
    harness.connect();
    harness.take_events();
    // the bring-up power on found no card, which is not a card error
    assert!(!harness.device.slot(0).unwrap().card_error());

    harness.handle.insert_card(0, SimCard::new(ATR.to_vec()));
    harness.pump();
    assert!(harness.device.is_connected(0));
    assert_eq!(harness.device.atr(0).unwrap().as_ref(), &ATR);
    assert_eq!(
        harness.take_events(),
        vec![
            DeviceEvent::ReaderStatus {
                slot: 0,
                present: true,
                connected: false
            },
            DeviceEvent::ReaderStatus {
                slot: 0,
                present: true,
                connected: true
            },
        ]
    );

    harness.handle.remove_card(0);
    harness.pump();
    assert!(!harness.device.check_presence(0));
    assert!(!harness.device.is_connected(0));
    assert_eq!(
        harness.take_events(),
        vec![DeviceEvent::ReaderStatus {
            slot: 0,
            present: false,
            connected: false
        }]
    );
}

#[test]
fn swapped_mute_card_is_connected_automatically() {
    let reader = SimulatedReader::new()
        .with_slot("Contact")
        .with_card(SimCard::mute(ATR.to_vec()));
    let config = DeviceConfig::new()
        .with_slot_count(1)
        .with_slot_status_probe(0)
        .with_auto_connect(0);
    let mut harness = Harness::new(reader, config);
    harness.connect();
    assert_eq!(harness.device.state(), State::Idle);
    assert!(harness.device.slot(0).unwrap().card_error());
    harness.take_events();

    harness.handle.remove_card(0);
    harness.handle.insert_card(0, SimCard::new(ATR.to_vec()));
    harness.pump();

    assert!(harness.device.is_connected(0));
    assert!(!harness.device.slot(0).unwrap().card_error());
    assert_eq!(
        harness.take_events().last(),
        Some(&DeviceEvent::ReaderStatus {
            slot: 0,
            present: true,
            connected: true
        })
    );
}

#[test]
fn sleep_and_wake_up_report_power_state() {
    let mut harness = one_slot(true);
    harness.connect();
    harness.take_events();

    harness.handle.sleep();
    harness.pump();
    assert_eq!(harness.device.state(), State::Sleeping);
    assert!(harness.handle.reader().is_sleeping());
    assert!(matches!(harness.device.connect_card(0), Err(Error::Busy(_))));

    harness.device.wake_up().unwrap();
    assert_eq!(harness.device.state(), State::WakingUp);
    harness.pump();
    assert_eq!(harness.device.state(), State::Idle);
    assert!(!harness.handle.reader().is_sleeping());

    assert_eq!(
        harness.take_events(),
        vec![
            DeviceEvent::PowerState { low_power: true },
            DeviceEvent::PowerState { low_power: false }
        ]
    );
}

#[test]
fn reconnect_after_close() {
    let mut harness = one_slot(true);
    harness.connect();
    harness.device.connect_card(0).unwrap();
    harness.pump();
    assert!(harness.device.is_connected(0));

    harness.device.disconnect().unwrap();
    harness.pump();
    assert_eq!(harness.device.state(), State::Closed);
    assert!(!harness.device.is_connected(0));

    harness.connect();
    assert_eq!(harness.device.state(), State::Idle);
    // the simulated reader powered its cards down with the link
    assert!(harness.device.check_presence(0));
    assert!(!harness.device.is_connected(0));
    assert_eq!(closed_events(&harness), 1);
    assert_eq!(harness.count(|event| *event == DeviceEvent::Created), 2);
}
