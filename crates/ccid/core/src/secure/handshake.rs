//! Three step AES-128 mutual authentication
//!
//! ```text
//! host                                      device
//!  |  00 0A 01 kk                              |
//!  | ----------------------------------------> |
//!  |                            FF || E(rndB)  |
//!  | <---------------------------------------- |
//!  |  00 FF || E(rndA) || E(rotl(rndB))        |
//!  | ----------------------------------------> |
//!  |                      00 || E(rotl(rndA))  |
//!  | <---------------------------------------- |
//! ```
//!
//! Every message travels as the payload of an escape command and its response.

use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use tracing::{debug, trace};
use zeroize::Zeroize;

use super::crypto::{self, Block16};
use super::session::{Role, SecureSession, SessionKeys};
use crate::constants::{BLOCK_SIZE, secure};
use crate::error::{AuthFailure, Error, Result};

/// Key slot selected for the authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyIndex {
    /// User key (0x00)
    User,
    /// Administrator key (0x01)
    Admin,
    /// Any other key slot
    Other(u8),
}

impl From<KeyIndex> for u8 {
    fn from(index: KeyIndex) -> Self {
        match index {
            KeyIndex::User => 0x00,
            KeyIndex::Admin => 0x01,
            KeyIndex::Other(value) => value,
        }
    }
}

impl From<u8> for KeyIndex {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::User,
            0x01 => Self::Admin,
            other => Self::Other(other),
        }
    }
}

/// Static key material enabling the secure channel
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecureParameters {
    #[zeroize(skip)]
    key_index: KeyIndex,
    key: Block16,
}

impl core::fmt::Debug for SecureParameters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecureParameters")
            .field("key_index", &self.key_index)
            .finish_non_exhaustive()
    }
}

impl SecureParameters {
    /// Create parameters from a key slot and its 16 byte value
    pub const fn new(key_index: KeyIndex, key: Block16) -> Self {
        Self { key_index, key }
    }

    /// Parse a hex encoded key
    pub fn from_hex(key_index: KeyIndex, key: &str) -> Result<Self> {
        let bytes = hex::decode(key).map_err(|_| Error::InvalidLength {
            expected: BLOCK_SIZE,
            actual: key.len() / 2,
        })?;
        let key: Block16 = bytes.as_slice().try_into().map_err(|_| Error::InvalidLength {
            expected: BLOCK_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self::new(key_index, key))
    }

    /// Key slot
    pub const fn key_index(&self) -> KeyIndex {
        self.key_index
    }

    /// Key value
    pub const fn key(&self) -> &Block16 {
        &self.key
    }
}

fn random_nonce() -> Block16 {
    let mut nonce = [0u8; BLOCK_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

fn block_at(data: &[u8], offset: usize) -> Block16 {
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(&data[offset..offset + BLOCK_SIZE]);
    block
}

/// Check a device response: opcode first, then exactly one block
fn check_step_response(step: u8, response: &[u8], opcode: u8) -> Result<Block16> {
    match response.first() {
        None => Err(Error::auth(step, AuthFailure::TooShort)),
        Some(&first) if first != opcode => Err(Error::auth(step, AuthFailure::DeviceError(first))),
        Some(_) if response.len() != secure::STEP_RESPONSE_SIZE => {
            Err(Error::auth(step, AuthFailure::BadFormat))
        }
        Some(_) => Ok(block_at(response, 1)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostStep {
    Start,
    AwaitingStep1,
    AwaitingStep3,
    Done,
}

/// What the host does after feeding a device response to the handshake
#[derive(Debug)]
pub enum HandshakeProgress {
    /// Send this escape payload and wait for the next response
    Send(Bytes),
    /// Authentication succeeded
    Established(SecureSession),
}

/// Host side of the mutual authentication
pub struct HostHandshake {
    params: SecureParameters,
    rnd_a: Block16,
    rnd_b: Block16,
    step: HostStep,
}

impl core::fmt::Debug for HostHandshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostHandshake")
            .field("key_index", &self.params.key_index)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl Drop for HostHandshake {
    fn drop(&mut self) {
        self.rnd_a.zeroize();
        self.rnd_b.zeroize();
    }
}

impl HostHandshake {
    /// Start a handshake with a fresh random host nonce
    pub fn new(params: SecureParameters) -> Self {
        Self::with_nonce(params, random_nonce())
    }

    /// Start a handshake with a caller supplied host nonce
    pub const fn with_nonce(params: SecureParameters, rnd_a: Block16) -> Self {
        Self {
            params,
            rnd_a,
            rnd_b: [0; BLOCK_SIZE],
            step: HostStep::Start,
        }
    }

    /// Step number the handshake is waiting on (1 or 3), 0 before the first command
    pub const fn step(&self) -> u8 {
        match self.step {
            HostStep::Start => 0,
            HostStep::AwaitingStep1 => 1,
            HostStep::AwaitingStep3 | HostStep::Done => 3,
        }
    }

    /// Payload of the AUTHENTICATE command opening the handshake
    pub fn authenticate_command(&mut self) -> Bytes {
        let key_index: u8 = self.params.key_index.into();
        debug!(key_index, "running AES mutual authentication");
        self.step = HostStep::AwaitingStep1;
        Bytes::copy_from_slice(&[
            secure::PROTOCOL_CODE,
            secure::OPCODE_AUTHENTICATE,
            secure::VERSION_AES128,
            key_index,
        ])
    }

    /// Feed the payload of the device's response to the last command
    pub fn on_response(&mut self, response: &[u8]) -> Result<HandshakeProgress> {
        match self.step {
            HostStep::AwaitingStep1 => self.on_step1(response).map(HandshakeProgress::Send),
            HostStep::AwaitingStep3 => self.on_step3(response).map(HandshakeProgress::Established),
            HostStep::Start | HostStep::Done => {
                Err(Error::auth(self.step(), AuthFailure::OutOfSequence))
            }
        }
    }

    fn on_step1(&mut self, response: &[u8]) -> Result<Bytes> {
        let encrypted = check_step_response(1, response, secure::OPCODE_FOLLOWING)?;
        self.rnd_b = crypto::ecb_decrypt(&self.params.key, &encrypted);
        trace!(rnd_b = %hex::encode(self.rnd_b), "device nonce");

        let mut command = BytesMut::with_capacity(2 + 2 * BLOCK_SIZE);
        command.put_u8(secure::PROTOCOL_CODE);
        command.put_u8(secure::OPCODE_FOLLOWING);
        command.put_slice(&crypto::ecb_encrypt(&self.params.key, &self.rnd_a));
        command.put_slice(&crypto::ecb_encrypt(
            &self.params.key,
            &crypto::rotate_left(&self.rnd_b),
        ));

        self.step = HostStep::AwaitingStep3;
        Ok(command.freeze())
    }

    fn on_step3(&mut self, response: &[u8]) -> Result<SecureSession> {
        let encrypted = check_step_response(3, response, secure::OPCODE_SUCCESS)?;
        let echoed = crypto::rotate_right(&crypto::ecb_decrypt(&self.params.key, &encrypted));
        if echoed != self.rnd_a {
            return Err(Error::auth(3, AuthFailure::BadCryptogram));
        }

        self.step = HostStep::Done;
        debug!("mutual authentication succeeded");
        Ok(SecureSession::new(
            Role::Host,
            SessionKeys::derive(&self.params.key, &self.rnd_a, &self.rnd_b),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceStep {
    AwaitingAuthenticate,
    AwaitingStep2,
    Done,
}

/// Device side of the mutual authentication, as run by the reader firmware
pub struct DeviceHandshake {
    params: SecureParameters,
    rnd_b: Block16,
    step: DeviceStep,
}

impl core::fmt::Debug for DeviceHandshake {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceHandshake")
            .field("key_index", &self.params.key_index)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl Drop for DeviceHandshake {
    fn drop(&mut self) {
        self.rnd_b.zeroize();
    }
}

impl DeviceHandshake {
    /// Wait for an AUTHENTICATE command with a fresh random device nonce
    pub fn new(params: SecureParameters) -> Self {
        Self::with_nonce(params, random_nonce())
    }

    /// Wait for an AUTHENTICATE command with a caller supplied device nonce
    pub const fn with_nonce(params: SecureParameters, rnd_b: Block16) -> Self {
        Self {
            params,
            rnd_b,
            step: DeviceStep::AwaitingAuthenticate,
        }
    }

    /// Answer an AUTHENTICATE command with the encrypted device nonce
    pub fn on_authenticate(&mut self, command: &[u8]) -> Result<Bytes> {
        if self.step != DeviceStep::AwaitingAuthenticate {
            return Err(Error::auth(1, AuthFailure::OutOfSequence));
        }
        let [protocol, opcode, version, key_index] = command else {
            return Err(Error::auth(1, AuthFailure::BadFormat));
        };
        if *protocol != secure::PROTOCOL_CODE || *opcode != secure::OPCODE_AUTHENTICATE {
            return Err(Error::auth(1, AuthFailure::BadFormat));
        }
        if *version != secure::VERSION_AES128
            || KeyIndex::from(*key_index) != self.params.key_index
        {
            return Err(Error::auth(1, AuthFailure::Unsupported));
        }

        self.step = DeviceStep::AwaitingStep2;
        let mut response = BytesMut::with_capacity(secure::STEP_RESPONSE_SIZE);
        response.put_u8(secure::OPCODE_FOLLOWING);
        response.put_slice(&crypto::ecb_encrypt(&self.params.key, &self.rnd_b));
        Ok(response.freeze())
    }

    /// Check the host's cryptogram and answer with the rotated host nonce
    pub fn on_step2(&mut self, command: &[u8]) -> Result<(Bytes, SecureSession)> {
        if self.step != DeviceStep::AwaitingStep2 {
            return Err(Error::auth(2, AuthFailure::OutOfSequence));
        }
        if command.len() != 2 + 2 * BLOCK_SIZE
            || command[0] != secure::PROTOCOL_CODE
            || command[1] != secure::OPCODE_FOLLOWING
        {
            return Err(Error::auth(2, AuthFailure::BadFormat));
        }

        let rnd_a = crypto::ecb_decrypt(&self.params.key, &block_at(command, 2));
        let echoed = crypto::rotate_right(&crypto::ecb_decrypt(
            &self.params.key,
            &block_at(command, 2 + BLOCK_SIZE),
        ));
        if echoed != self.rnd_b {
            return Err(Error::auth(2, AuthFailure::BadCryptogram));
        }

        self.step = DeviceStep::Done;
        let mut response = BytesMut::with_capacity(secure::STEP_RESPONSE_SIZE);
        response.put_u8(secure::OPCODE_SUCCESS);
        response.put_slice(&crypto::ecb_encrypt(
            &self.params.key,
            &crypto::rotate_left(&rnd_a),
        ));
        let session = SecureSession::new(
            Role::Device,
            SessionKeys::derive(&self.params.key, &rnd_a, &self.rnd_b),
        );
        Ok((response.freeze(), session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEY: Block16 = hex!("00112233445566778899AABBCCDDEEFF");

    fn params(key: Block16) -> SecureParameters {
        SecureParameters::new(KeyIndex::User, key)
    }

    #[test]
    fn test_authenticate_command() {
        let mut host = HostHandshake::new(SecureParameters::new(KeyIndex::Admin, KEY));
        assert_eq!(host.step(), 0);
        assert_eq!(host.authenticate_command().as_ref(), &hex!("000A0101"));
        assert_eq!(host.step(), 1);
    }

    #[test]
    fn test_full_exchange() {
        let rnd_a = hex!("A0A1A2A3A4A5A6A7A8A9AAABACADAEAF");
        let rnd_b = hex!("B0B1B2B3B4B5B6B7B8B9BABBBCBDBEBF");
        let mut host = HostHandshake::with_nonce(params(KEY), rnd_a);
        let mut device = DeviceHandshake::with_nonce(params(KEY), rnd_b);

        let step1 = device.on_authenticate(&host.authenticate_command()).unwrap();
        assert_eq!(step1.len(), 17);
        assert_eq!(step1[0], 0xFF);

        let HandshakeProgress::Send(step2) = host.on_response(&step1).unwrap() else {
            panic!("expected a step 2 command");
        };
        assert_eq!(step2.len(), 34);

        let (step3, device_session) = device.on_step2(&step2).unwrap();
        let HandshakeProgress::Established(host_session) = host.on_response(&step3).unwrap()
        else {
            panic!("expected an established session");
        };

        let expected = SessionKeys::derive(&KEY, &rnd_a, &rnd_b);
        assert_eq!(host_session.keys().enc_key(), expected.enc_key());
        assert_eq!(device_session.keys().mac_key(), expected.mac_key());
        assert_eq!(host_session.keys().send_iv(), device_session.keys().recv_iv());
    }

    #[test]
    fn test_step1_errors() {
        let mut host = HostHandshake::new(params(KEY));
        host.authenticate_command();
        assert_eq!(
            host.on_response(&[]).unwrap_err(),
            Error::auth(1, AuthFailure::TooShort)
        );

        let mut host = HostHandshake::new(params(KEY));
        host.authenticate_command();
        assert_eq!(
            host.on_response(&[0x6A]).unwrap_err(),
            Error::auth(1, AuthFailure::DeviceError(0x6A))
        );

        let mut host = HostHandshake::new(params(KEY));
        host.authenticate_command();
        assert_eq!(
            host.on_response(&[0xFF; 16]).unwrap_err(),
            Error::auth(1, AuthFailure::BadFormat)
        );
    }

    #[test]
    fn test_out_of_sequence() {
        let mut host = HostHandshake::new(params(KEY));
        assert!(matches!(
            host.on_response(&[0xFF; 17]),
            Err(Error::Authentication {
                reason: AuthFailure::OutOfSequence,
                ..
            })
        ));

        let mut device = DeviceHandshake::new(params(KEY));
        assert!(device.on_step2(&[0; 34]).is_err());
    }

    #[test]
    fn test_device_rejects_wrong_key() {
        let mut host = HostHandshake::new(params(hex!("FFEEDDCCBBAA99887766554433221100")));
        let mut device = DeviceHandshake::new(params(KEY));

        let step1 = device.on_authenticate(&host.authenticate_command()).unwrap();
        let HandshakeProgress::Send(step2) = host.on_response(&step1).unwrap() else {
            panic!("expected a step 2 command");
        };
        assert_eq!(
            device.on_step2(&step2).unwrap_err(),
            Error::auth(2, AuthFailure::BadCryptogram)
        );
    }

    #[test]
    fn test_device_rejects_other_key_index() {
        let mut device = DeviceHandshake::new(params(KEY));
        assert_eq!(
            device.on_authenticate(&hex!("000A0103")).unwrap_err(),
            Error::auth(1, AuthFailure::Unsupported)
        );
    }

    #[test]
    fn test_params_from_hex() {
        let parsed = SecureParameters::from_hex(KeyIndex::User, "00112233445566778899AABBCCDDEEFF")
            .unwrap();
        assert_eq!(parsed.key(), &KEY);
        assert!(SecureParameters::from_hex(KeyIndex::User, "0011").is_err());
        assert!(SecureParameters::from_hex(KeyIndex::User, "zz").is_err());
    }
}
