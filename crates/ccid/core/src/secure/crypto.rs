//! AES-128 primitives used by the secure channel
//!
//! Padding everywhere is ISO/IEC 9797-1 method 2: a mandatory `0x80` followed by zeros
//! up to the next block boundary.

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cipher::{
    Block, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, Iv, Key, KeyInit,
    KeyIvInit, block_padding::Iso7816,
};

use crate::constants::BLOCK_SIZE;
use crate::error::{Error, Result};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

/// A 16 byte AES block or key
pub type Block16 = [u8; BLOCK_SIZE];

/// Encrypt a single block with AES-128 in ECB mode
pub fn ecb_encrypt(key: &Block16, block: &Block16) -> Block16 {
    let cipher = Aes128::new(Key::<Aes128>::from_slice(key));
    let mut block = Block::<Aes128>::clone_from_slice(block);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// Decrypt a single block with AES-128 in ECB mode
pub fn ecb_decrypt(key: &Block16, block: &Block16) -> Block16 {
    let cipher = Aes128::new(Key::<Aes128>::from_slice(key));
    let mut block = Block::<Aes128>::clone_from_slice(block);
    cipher.decrypt_block(&mut block);
    block.into()
}

/// Length of `len` bytes once padded
pub const fn padded_len(len: usize) -> usize {
    (len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

/// Pad and encrypt `data` with AES-128-CBC
pub fn cbc_encrypt(key: &Block16, iv: &Block16, data: &[u8]) -> Result<Bytes> {
    let msg_len = data.len();
    let total = padded_len(msg_len);
    let mut buf = BytesMut::zeroed(total);
    buf[..msg_len].copy_from_slice(data);
    let encrypted = Encryptor::new(Key::<Aes128>::from_slice(key), Iv::<Encryptor>::from_slice(iv))
        .encrypt_padded_mut::<Iso7816>(&mut buf, msg_len)
        .map_err(|_| Error::InvalidLength {
            expected: total,
            actual: msg_len,
        })?;
    Ok(Bytes::copy_from_slice(encrypted))
}

/// Decrypt `data` with AES-128-CBC and strip the padding
///
/// Fails with [`Error::PaddingInvalid`] when the plaintext does not end with `0x80`
/// followed by zeros, or when `data` is not a whole number of blocks.
pub fn cbc_decrypt(key: &Block16, iv: &Block16, data: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::from(data);
    let decrypted = Decryptor::new(Key::<Aes128>::from_slice(key), Iv::<Decryptor>::from_slice(iv))
        .decrypt_padded_mut::<Iso7816>(&mut buf)
        .map_err(|_| Error::PaddingInvalid)?;
    Ok(Bytes::copy_from_slice(decrypted))
}

/// CBC-MAC variant used to authenticate frames
///
/// The message is padded, then each block is XORed with the running value and
/// encrypted with AES-ECB, starting from `iv`. The result is the last cipher block.
pub fn cmac(key: &Block16, iv: &Block16, data: &[u8]) -> Result<Block16> {
    let encrypted = cbc_encrypt(key, iv, data)?;
    let mut mac = [0u8; BLOCK_SIZE];
    mac.copy_from_slice(&encrypted[encrypted.len() - BLOCK_SIZE..]);
    Ok(mac)
}

/// Rotate a block one byte to the left (byte 0 moves to the end)
pub fn rotate_left(block: &Block16) -> Block16 {
    let mut out = *block;
    out.rotate_left(1);
    out
}

/// Rotate a block one byte to the right (the last byte moves to the front)
pub fn rotate_right(block: &Block16) -> Block16 {
    let mut out = *block;
    out.rotate_right(1);
    out
}

/// XOR two blocks
pub fn xor(a: &Block16, b: &Block16) -> Block16 {
    let mut out = [0u8; BLOCK_SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEY: Block16 = hex!("000102030405060708090a0b0c0d0e0f");

    #[test]
    fn test_fips197_vector() {
        let plaintext = hex!("00112233445566778899aabbccddeeff");
        let ciphertext = ecb_encrypt(&KEY, &plaintext);
        assert_eq!(ciphertext, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
        assert_eq!(ecb_decrypt(&KEY, &ciphertext), plaintext);
    }

    #[test]
    fn test_padding_always_added() {
        assert_eq!(padded_len(0), 16);
        assert_eq!(padded_len(15), 16);
        assert_eq!(padded_len(16), 32);

        let iv = [0u8; 16];
        let encrypted = cbc_encrypt(&KEY, &iv, &[0u8; 16]).unwrap();
        assert_eq!(encrypted.len(), 32);
        assert_eq!(cbc_decrypt(&KEY, &iv, &encrypted).unwrap().as_ref(), &[0u8; 16]);
    }

    #[test]
    fn test_cbc_first_block_is_ecb_of_xor() {
        // with a zero IV the first CBC block equals ECB of the plaintext
        let data = hex!("00112233445566778899aabbccddeeff");
        let encrypted = cbc_encrypt(&KEY, &[0u8; 16], &data).unwrap();
        assert_eq!(&encrypted[..16], &hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));
    }

    #[test]
    fn test_cmac_chains_blocks() {
        let iv = hex!("0f0e0d0c0b0a09080706050403020100");
        let data = hex!("0102030405");

        // manual chaining over the single padded block
        let mut block = [0u8; 16];
        block[..5].copy_from_slice(&data);
        block[5] = 0x80;
        let expected = ecb_encrypt(&KEY, &xor(&block, &iv));

        assert_eq!(cmac(&KEY, &iv, &data).unwrap(), expected);
    }

    #[test]
    fn test_bad_padding() {
        let iv = [0u8; 16];
        // a block that decrypts to all zeros has no 0x80 marker
        let zeros = ecb_encrypt(&KEY, &[0u8; 16]);
        assert_eq!(cbc_decrypt(&KEY, &iv, &zeros), Err(Error::PaddingInvalid));
        assert_eq!(cbc_decrypt(&KEY, &iv, &[0u8; 5]), Err(Error::PaddingInvalid));
    }

    #[test]
    fn test_rotation() {
        let block = hex!("000102030405060708090a0b0c0d0e0f");
        let left = rotate_left(&block);
        assert_eq!(left, hex!("0102030405060708090a0b0c0d0e0f00"));
        assert_eq!(rotate_right(&left), block);
    }
}
