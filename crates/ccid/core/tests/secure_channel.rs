//! Secure channel properties: key agreement, IV chaining and tamper detection

use hex_literal::hex;
use pcsclike_ccid::{
    CommandCode, DeviceHandshake, Error, Frame, HandshakeProgress, HostHandshake, KeyIndex,
    ResponseCode, SecureParameters, SecureSession, SlotStatus,
    secure::crypto::{self, Block16},
};
use rand::{Rng, RngCore};

fn random_block() -> Block16 {
    let mut block = [0u8; 16];
    rand::rng().fill_bytes(&mut block);
    block
}

fn handshake(host_key: Block16, device_key: Block16) -> Result<(SecureSession, SecureSession), Error> {
    let mut host = HostHandshake::new(SecureParameters::new(KeyIndex::User, host_key));
    let mut device = DeviceHandshake::new(SecureParameters::new(KeyIndex::User, device_key));

    let step1 = device.on_authenticate(&host.authenticate_command())?;
    let HandshakeProgress::Send(step2) = host.on_response(&step1)? else {
        panic!("host finished after step 1");
    };
    let (step3, device_session) = device.on_step2(&step2)?;
    let HandshakeProgress::Established(host_session) = host.on_response(&step3)? else {
        panic!("host did not finish after step 3");
    };
    Ok((host_session, device_session))
}

#[test]
fn fips197_aes128_vector() {
    let key = hex!("000102030405060708090a0b0c0d0e0f");
    let ciphertext = crypto::ecb_encrypt(&key, &hex!("00112233445566778899aabbccddeeff"));
    assert_eq!(ciphertext, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
}

#[test]
fn both_sides_derive_the_same_session() {
    for _ in 0..32 {
        let key = random_block();
        let (host, device) = handshake(key, key).unwrap();
        assert_eq!(host.keys().enc_key(), device.keys().enc_key());
        assert_eq!(host.keys().mac_key(), device.keys().mac_key());
        assert_eq!(host.keys().send_iv(), device.keys().recv_iv());
        assert_eq!(host.keys().recv_iv(), device.keys().send_iv());
    }
}

#[test]
fn wrong_key_fails_authentication() {
    let err = handshake(random_block(), random_block()).unwrap_err();
    assert!(err.is_authentication());
}

#[test]
fn chains_stay_in_lockstep() {
    let key = random_block();
    let (mut host, mut device) = handshake(key, key).unwrap();
    let mut rng = rand::rng();

    for seq in 0..=255u8 {
        let len = rng.random_range(0..=256);
        let mut payload = vec![0u8; len];
        rng.fill_bytes(&mut payload);

        let command = Frame::command(CommandCode::XfrBlock, 0, seq, payload.clone());
        let wire = host.seal_bytes(&command).unwrap();
        let opened = device.open_bytes(&wire).unwrap();
        assert_eq!(opened.payload.as_ref(), payload.as_slice());
        assert_eq!(opened.seq, seq);

        let response =
            Frame::response(ResponseCode::DataBlock, 0, seq, SlotStatus::new(0), 0, payload.clone());
        let wire = device.seal_bytes(&response).unwrap();
        let opened = host.open_bytes(&wire).unwrap();
        assert_eq!(opened.payload.as_ref(), payload.as_slice());

        assert_eq!(host.keys().send_iv(), device.keys().recv_iv());
        assert_eq!(host.keys().recv_iv(), device.keys().send_iv());
    }
}

#[test]
fn dropped_frame_breaks_the_chain() {
    let key = random_block();
    let (mut host, mut device) = handshake(key, key).unwrap();

    let first = Frame::command(CommandCode::GetSlotStatus, 0, 0, Vec::new());
    let second = Frame::command(CommandCode::GetSlotStatus, 0, 1, Vec::new());
    let _lost = host.seal(&first).unwrap();
    let sealed = host.seal(&second).unwrap();

    assert!(device.open(&sealed).unwrap_err().is_integrity_failure());
}

#[test]
fn any_bit_flip_is_detected() {
    let key = random_block();
    let (mut host, device) = handshake(key, key).unwrap();

    let command = Frame::command(CommandCode::XfrBlock, 0, 0, hex!("00B0000010").to_vec());
    let sealed = host.seal(&command).unwrap().encode();
    let cmac_start = sealed.len() - 8;

    for byte in 10..sealed.len() {
        for bit in 0..8 {
            let mut tampered = sealed.to_vec();
            tampered[byte] ^= 1 << bit;

            // each attempt starts from the untouched receive IV
            let mut receiver = device.clone();
            let err = receiver.open_bytes(&tampered).unwrap_err();
            if byte >= cmac_start {
                assert_eq!(err, Error::CmacInvalid, "byte {byte} bit {bit}");
            } else {
                // padding is checked before the tag
                assert!(
                    matches!(err, Error::CmacInvalid | Error::PaddingInvalid),
                    "byte {byte} bit {bit}: {err}"
                );
            }
        }
    }
}
