//! CCID frame codec
//!
//! Every message exchanged with the reader is a 10 byte header followed by a payload:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | message code |
//! | 1..5 | payload length, little endian, bit 31 set when the payload is ciphered |
//! | 5 | slot number |
//! | 6 | sequence number |
//! | 7..10 | message specific bytes (slot status and slot error on responses) |

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::constants::{CIPHERED_FLAG, HEADER_SIZE, MAX_PAYLOAD_SIZE, command, response};
use crate::error::FrameError;
use crate::status::{SlotError, SlotStatus};

/// Command message codes sent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum CommandCode {
    /// Power the card on and return its ATR
    #[display("IccPowerOn")]
    IccPowerOn,
    /// Power the card off
    #[display("IccPowerOff")]
    IccPowerOff,
    /// Query the slot status
    #[display("GetSlotStatus")]
    GetSlotStatus,
    /// Vendor specific reader command
    #[display("Escape")]
    Escape,
    /// Exchange an APDU with the card
    #[display("XfrBlock")]
    XfrBlock,
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> Self {
        match code {
            CommandCode::IccPowerOn => command::ICC_POWER_ON,
            CommandCode::IccPowerOff => command::ICC_POWER_OFF,
            CommandCode::GetSlotStatus => command::GET_SLOT_STATUS,
            CommandCode::Escape => command::ESCAPE,
            CommandCode::XfrBlock => command::XFR_BLOCK,
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            command::ICC_POWER_ON => Ok(Self::IccPowerOn),
            command::ICC_POWER_OFF => Ok(Self::IccPowerOff),
            command::GET_SLOT_STATUS => Ok(Self::GetSlotStatus),
            command::ESCAPE => Ok(Self::Escape),
            command::XFR_BLOCK => Ok(Self::XfrBlock),
            other => Err(FrameError::UnknownCode(other)),
        }
    }
}

/// Response message codes sent by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ResponseCode {
    /// Data returned by the card (ATR or R-APDU)
    #[display("DataBlock")]
    DataBlock,
    /// Slot status only
    #[display("SlotStatus")]
    SlotStatus,
    /// Answer to an escape command
    #[display("Escape")]
    Escape,
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::DataBlock => response::DATA_BLOCK,
            ResponseCode::SlotStatus => response::SLOT_STATUS,
            ResponseCode::Escape => response::ESCAPE,
        }
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            response::DATA_BLOCK => Ok(Self::DataBlock),
            response::SLOT_STATUS => Ok(Self::SlotStatus),
            response::ESCAPE => Ok(Self::Escape),
            other => Err(FrameError::UnknownCode(other)),
        }
    }
}

/// A CCID frame, command or response
///
/// `payload` holds every byte after the header. On a ciphered frame this is the
/// ciphertext followed by the truncated CMAC, and the length field counts both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message code
    pub code: u8,
    /// Whether bit 31 of the length field is set
    pub ciphered: bool,
    /// Slot number
    pub slot: u8,
    /// Sequence number
    pub seq: u8,
    /// Bytes 7, 8 and 9 of the header
    pub params: [u8; 3],
    /// Payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a command frame
    pub fn command(code: CommandCode, slot: u8, seq: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            ciphered: false,
            slot,
            seq,
            params: [0; 3],
            payload: payload.into(),
        }
    }

    /// Create a response frame with the given status and error bytes
    pub fn response(
        code: ResponseCode,
        slot: u8,
        seq: u8,
        status: SlotStatus,
        error: u8,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            code: code.into(),
            ciphered: false,
            slot,
            seq,
            params: [status.raw(), error, 0],
            payload: payload.into(),
        }
    }

    /// Build the header for this frame announcing `length` payload bytes
    pub fn header_with(&self, length: usize, ciphered: bool) -> [u8; HEADER_SIZE] {
        let mut raw = (length as u32) & !CIPHERED_FLAG;
        if ciphered {
            raw |= CIPHERED_FLAG;
        }
        let mut header = [0u8; HEADER_SIZE];
        header[0] = self.code;
        header[1..5].copy_from_slice(&raw.to_le_bytes());
        header[5] = self.slot;
        header[6] = self.seq;
        header[7..].copy_from_slice(&self.params);
        header
    }

    /// Header as it goes on the wire
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        self.header_with(self.payload.len(), self.ciphered)
    }

    /// Serialize header and payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a complete frame
    ///
    /// The length field, ciphered flag masked, must match the bytes following the header.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let (frame, declared) = Self::decode_header(data)?;
        let actual = data.len() - HEADER_SIZE;
        if declared != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            payload: Bytes::copy_from_slice(&data[HEADER_SIZE..]),
            ..frame
        })
    }

    /// Parse a frame, substituting an empty payload when the length field is wrong.
    ///
    /// The mismatch is still reported alongside the frame so the caller can act on it.
    pub fn decode_lenient(data: &[u8]) -> Result<(Self, Option<FrameError>), FrameError> {
        match Self::decode(data) {
            Ok(frame) => Ok((frame, None)),
            Err(err @ FrameError::LengthMismatch { .. }) => {
                let (frame, _) = Self::decode_header(data)?;
                Ok((frame, Some(err)))
            }
            Err(err) => Err(err),
        }
    }

    fn decode_header(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::TooShort(data.len()));
        }
        let raw = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let declared = (raw & !CIPHERED_FLAG) as usize;
        if declared > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(declared));
        }
        let frame = Self {
            code: data[0],
            ciphered: raw & CIPHERED_FLAG != 0,
            slot: data[5],
            seq: data[6],
            params: [data[7], data[8], data[9]],
            payload: Bytes::new(),
        };
        Ok((frame, declared))
    }

    /// Response code, if this is a known response
    pub fn response_code(&self) -> Result<ResponseCode, FrameError> {
        ResponseCode::try_from(self.code)
    }

    /// Command code, if this is a known command
    pub fn command_code(&self) -> Result<CommandCode, FrameError> {
        CommandCode::try_from(self.code)
    }

    /// Slot status (byte 7), meaningful on responses only
    pub const fn status(&self) -> SlotStatus {
        SlotStatus::new(self.params[0])
    }

    /// Slot error (byte 8), meaningful on responses only
    pub const fn error(&self) -> u8 {
        self.params[1]
    }

    /// Decoded slot error, `None` when the response reports success
    pub const fn slot_error(&self) -> Option<SlotError> {
        SlotError::check(self.status(), self.error())
    }
}

/// Builds outgoing command frames and tracks the sequence counter
#[derive(Debug, Default, Clone)]
pub struct CommandEncoder {
    seq: u8,
}

impl CommandEncoder {
    /// Create an encoder starting at sequence number 0
    pub const fn new() -> Self {
        Self { seq: 0 }
    }

    /// Build the next command frame
    pub fn encode_command(
        &mut self,
        code: CommandCode,
        slot: u8,
        payload: impl Into<Bytes>,
    ) -> Frame {
        let frame = Frame::command(code, slot, self.seq, payload);
        trace!(%code, slot, seq = self.seq, "encoding command");
        self.seq = self.seq.wrapping_add(1);
        frame
    }

    /// Sequence number the next command will carry
    pub const fn next_seq(&self) -> u8 {
        self.seq
    }

    /// Restart the sequence at 0
    pub const fn reset(&mut self) {
        self.seq = 0;
    }
}

/// Reassembles complete frames from transport chunks
///
/// Relies on the header length field, so ciphered frames are delimited correctly as well.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
}

impl FrameAssembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk received from the transport
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete frame out of the buffer
    ///
    /// A header announcing more than the maximum payload drops the buffered bytes.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        let raw = u32::from_le_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]);
        let declared = (raw & !CIPHERED_FLAG) as usize;
        if declared > MAX_PAYLOAD_SIZE {
            self.buffer.clear();
            return Err(FrameError::PayloadTooLarge(declared));
        }
        let total = HEADER_SIZE + declared;
        if self.buffer.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buffer.split_to(total).freeze()))
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// One slot entry of a slot change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotChange {
    /// Slot number
    pub slot: u8,
    /// A card is present
    pub present: bool,
    /// Presence changed since the last notification
    pub changed: bool,
}

/// Decode an `RDR_to_PC_NotifySlotChange` message
///
/// Each following byte carries 4 slots, 2 bits per slot (bit 0 present, bit 1 changed).
pub fn decode_slot_change(data: &[u8], slot_count: usize) -> Result<Vec<SlotChange>, FrameError> {
    match data.first() {
        None => return Err(FrameError::TooShort(0)),
        Some(&response::NOTIFY_SLOT_CHANGE) => {}
        Some(&other) => return Err(FrameError::UnknownCode(other)),
    }
    let bits = &data[1..];
    let available = bits.len() * 4;
    Ok((0..slot_count.min(available))
        .map(|slot| {
            let byte = bits[slot / 4] >> ((slot % 4) * 2);
            SlotChange {
                slot: slot as u8,
                present: byte & 0x01 != 0,
                changed: byte & 0x02 != 0,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{CommandStatus, IccStatus};
    use hex_literal::hex;

    #[test]
    fn test_encode_command_layout() {
        let mut encoder = CommandEncoder::new();
        let frame = encoder.encode_command(CommandCode::XfrBlock, 1, hex!("00A4040000").to_vec());
        assert_eq!(
            frame.encode().as_ref(),
            hex!("6F 05000000 01 00 000000 00A4040000")
        );
        assert_eq!(encoder.next_seq(), 1);
    }

    #[test]
    fn test_ciphered_flag_masked() {
        let mut frame = Frame::command(CommandCode::Escape, 0, 3, vec![0xAA; 24]);
        frame.ciphered = true;
        let encoded = frame.encode();
        assert_eq!(&encoded[1..5], &hex!("18000080"));

        let decoded = Frame::decode(&encoded).unwrap();
        assert!(decoded.ciphered);
        assert_eq!(decoded.payload.len(), 24);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_response_fields() {
        let data = hex!("80 02000000 00 07 41 FE 00 3B00");
        let frame = Frame::decode(&data).unwrap();
        assert_eq!(frame.response_code().unwrap(), ResponseCode::DataBlock);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.status().icc(), IccStatus::Inactive);
        assert_eq!(frame.status().command(), CommandStatus::Failed);
        assert_eq!(frame.slot_error(), Some(SlotError::IccMute));
    }

    #[test]
    fn test_length_mismatch() {
        let data = hex!("80 05000000 00 00 00 00 00 0102");
        assert_eq!(
            Frame::decode(&data),
            Err(FrameError::LengthMismatch {
                declared: 5,
                actual: 2
            })
        );

        let (frame, err) = Frame::decode_lenient(&data).unwrap();
        assert!(frame.payload.is_empty());
        assert!(matches!(err, Some(FrameError::LengthMismatch { .. })));
    }

    #[test]
    fn test_too_short() {
        assert_eq!(Frame::decode(&[0x80, 0x00]), Err(FrameError::TooShort(2)));
    }

    #[test]
    fn test_sequence_wraps() {
        let mut encoder = CommandEncoder::new();
        for _ in 0..256 {
            encoder.encode_command(CommandCode::GetSlotStatus, 0, Bytes::new());
        }
        assert_eq!(encoder.next_seq(), 0);
    }

    #[test]
    fn test_assembler_split_chunks() {
        let first = Frame::command(CommandCode::XfrBlock, 0, 0, vec![0x11; 30]).encode();
        let second = Frame::command(CommandCode::IccPowerOn, 1, 1, Bytes::new()).encode();
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let mut assembler = FrameAssembler::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(7) {
            assembler.push(chunk);
            while let Some(frame) = assembler.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![first, second]);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_rejects_oversized() {
        let mut assembler = FrameAssembler::new();
        assembler.push(&hex!("80 FFFFFF7F 00 00 00 00 00"));
        assert!(matches!(
            assembler.next_frame(),
            Err(FrameError::PayloadTooLarge(_))
        ));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_slot_change() {
        // slot 0 present, slot 1 changed and absent, slot 2 present and changed
        let changes = decode_slot_change(&hex!("50 39"), 3).unwrap();
        assert_eq!(
            changes,
            vec![
                SlotChange {
                    slot: 0,
                    present: true,
                    changed: false
                },
                SlotChange {
                    slot: 1,
                    present: false,
                    changed: true
                },
                SlotChange {
                    slot: 2,
                    present: true,
                    changed: true
                },
            ]
        );
        assert!(decode_slot_change(&hex!("81 00"), 1).is_err());
    }
}
