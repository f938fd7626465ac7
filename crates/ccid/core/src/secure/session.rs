//! Session keys and per-frame protection

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;
use zeroize::Zeroize;

use super::crypto::{self, Block16};
use crate::constants::{BLOCK_SIZE, CMAC_SIZE};
use crate::error::{Error, Result};
use crate::frame::Frame;

/// Which end of the link a session protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Seals commands, opens responses
    Host,
    /// Seals responses, opens commands
    Device,
}

/// Session keys and IV chain derived by the mutual authentication
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SessionKeys {
    /// Encryption key
    enc: Block16,
    /// MAC key
    mac: Block16,
    /// IV for the next frame we send
    send_iv: Block16,
    /// IV for the next frame we receive
    recv_iv: Block16,
}

impl core::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Derive the session keys from the static key and both nonces
    ///
    /// SV1 = A[0..4] | B[0..4] | A[8..12] | B[8..12], SV2 = A[4..8] | B[4..8] | A[12..16] | B[12..16].
    /// The encryption and MAC keys are the static key applied to SV1 and SV2, the
    /// first IV is the MAC key applied to A XOR B.
    pub fn derive(key: &Block16, rnd_a: &Block16, rnd_b: &Block16) -> Self {
        let mut sv1 = [0u8; BLOCK_SIZE];
        let mut sv2 = [0u8; BLOCK_SIZE];
        for (chunk, offset) in [0usize, 8].into_iter().enumerate() {
            let at = chunk * 8;
            sv1[at..at + 4].copy_from_slice(&rnd_a[offset..offset + 4]);
            sv1[at + 4..at + 8].copy_from_slice(&rnd_b[offset..offset + 4]);
            sv2[at..at + 4].copy_from_slice(&rnd_a[offset + 4..offset + 8]);
            sv2[at + 4..at + 8].copy_from_slice(&rnd_b[offset + 4..offset + 8]);
        }

        let enc = crypto::ecb_encrypt(key, &sv1);
        let mac = crypto::ecb_encrypt(key, &sv2);
        let iv = crypto::ecb_encrypt(&mac, &crypto::xor(rnd_a, rnd_b));
        sv1.zeroize();
        sv2.zeroize();

        Self {
            enc,
            mac,
            send_iv: iv,
            recv_iv: iv,
        }
    }

    /// Session encryption key
    pub const fn enc_key(&self) -> &Block16 {
        &self.enc
    }

    /// Session MAC key
    pub const fn mac_key(&self) -> &Block16 {
        &self.mac
    }

    /// IV of the next outgoing frame
    pub const fn send_iv(&self) -> &Block16 {
        &self.send_iv
    }

    /// IV of the next incoming frame
    pub const fn recv_iv(&self) -> &Block16 {
        &self.recv_iv
    }
}

/// Established secure channel for one side of the link
///
/// IVs are chained: each frame's full CMAC becomes the IV of the next frame in the
/// same direction, so a dropped or altered frame desynchronizes every later check.
#[derive(Debug, Clone)]
pub struct SecureSession {
    role: Role,
    keys: SessionKeys,
}

impl SecureSession {
    /// Wrap derived keys for the given role
    pub fn new(role: Role, keys: SessionKeys) -> Self {
        Self { role, keys }
    }

    /// Role of this session
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Current keys and IVs
    pub const fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Commands are authenticated with the ciphered flag clear, responses with it set
    const fn mac_flag(&self, sending: bool) -> bool {
        match (self.role, sending) {
            (Role::Host, true) | (Role::Device, false) => false,
            (Role::Host, false) | (Role::Device, true) => true,
        }
    }

    fn compute_cmac(&self, frame: &Frame, payload: &[u8], flag: bool, iv: &Block16) -> Result<Block16> {
        let mut buf = BytesMut::with_capacity(frame.header().len() + payload.len());
        buf.put_slice(&frame.header_with(payload.len(), flag));
        buf.put_slice(payload);
        crypto::cmac(&self.keys.mac, iv, &buf)
    }

    /// Encrypt a plain frame and append its truncated CMAC
    pub fn seal(&mut self, frame: &Frame) -> Result<Frame> {
        let flag = self.mac_flag(true);
        let cmac = self.compute_cmac(frame, &frame.payload, flag, &self.keys.send_iv)?;
        let ciphertext = crypto::cbc_encrypt(&self.keys.enc, &self.keys.send_iv, &frame.payload)?;

        let mut payload = BytesMut::with_capacity(ciphertext.len() + CMAC_SIZE);
        payload.put_slice(&ciphertext);
        payload.put_slice(&cmac[..CMAC_SIZE]);

        trace!(
            seq = frame.seq,
            plain = %hex::encode(&frame.payload),
            cmac = %hex::encode(&cmac[..CMAC_SIZE]),
            "sealed frame"
        );
        self.keys.send_iv = cmac;

        Ok(Frame {
            ciphered: true,
            payload: payload.freeze(),
            ..frame.clone()
        })
    }

    /// Verify and decrypt a ciphered frame
    ///
    /// The IV only advances when the frame checks out.
    pub fn open(&mut self, frame: &Frame) -> Result<Frame> {
        if !frame.ciphered {
            return Err(Error::CmacInvalid);
        }
        if frame.payload.len() < CMAC_SIZE {
            return Err(Error::InvalidLength {
                expected: CMAC_SIZE + BLOCK_SIZE,
                actual: frame.payload.len(),
            });
        }
        let (ciphertext, tag) = frame.payload.split_at(frame.payload.len() - CMAC_SIZE);
        let plain = crypto::cbc_decrypt(&self.keys.enc, &self.keys.recv_iv, ciphertext)?;

        let flag = self.mac_flag(false);
        let cmac = self.compute_cmac(frame, &plain, flag, &self.keys.recv_iv)?;
        if cmac[..CMAC_SIZE] != *tag {
            return Err(Error::CmacInvalid);
        }

        trace!(seq = frame.seq, plain = %hex::encode(&plain), "opened frame");
        self.keys.recv_iv = cmac;

        Ok(Frame {
            ciphered: frame.ciphered,
            payload: plain,
            ..frame.clone()
        })
    }

    /// Open a frame given as raw bytes
    pub fn open_bytes(&mut self, data: &[u8]) -> Result<Frame> {
        let frame = Frame::decode(data)?;
        self.open(&frame)
    }

    /// Seal a frame and serialize it
    pub fn seal_bytes(&mut self, frame: &Frame) -> Result<Bytes> {
        Ok(self.seal(frame)?.encode())
    }
}
