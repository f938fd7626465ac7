//! Wire constants shared by the frame codec and the secure channel

/// Size of the CCID header preceding every payload
pub const HEADER_SIZE: usize = 10;

/// Flag carried in the most significant bit of the length field when the payload is ciphered
pub const CIPHERED_FLAG: u32 = 0x8000_0000;

/// Largest payload accepted by the codec (extended APDU plus secure channel overhead)
pub const MAX_PAYLOAD_SIZE: usize = 0x1_0000 + 32;

/// Size of the truncated CMAC appended to ciphered frames
pub const CMAC_SIZE: usize = 8;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Padding marker opening the ISO/IEC 9797-1 method 2 padding
pub const PADDING_MARKER: u8 = 0x80;

/// Command message codes (host to reader)
pub mod command {
    /// PC_to_RDR_IccPowerOn
    pub const ICC_POWER_ON: u8 = 0x62;
    /// PC_to_RDR_IccPowerOff
    pub const ICC_POWER_OFF: u8 = 0x63;
    /// PC_to_RDR_GetSlotStatus
    pub const GET_SLOT_STATUS: u8 = 0x65;
    /// PC_to_RDR_Escape
    pub const ESCAPE: u8 = 0x6B;
    /// PC_to_RDR_XfrBlock
    pub const XFR_BLOCK: u8 = 0x6F;
}

/// Response message codes (reader to host)
pub mod response {
    /// RDR_to_PC_DataBlock
    pub const DATA_BLOCK: u8 = 0x80;
    /// RDR_to_PC_SlotStatus
    pub const SLOT_STATUS: u8 = 0x81;
    /// RDR_to_PC_Escape
    pub const ESCAPE: u8 = 0x83;
    /// RDR_to_PC_NotifySlotChange, sent on the status channel
    pub const NOTIFY_SLOT_CHANGE: u8 = 0x50;
}

/// CCID slot error codes (byte 8 of a response header)
pub mod slot_error {
    /// Command aborted
    pub const CMD_ABORTED: u8 = 0xFF;
    /// Card is mute or absent
    pub const ICC_MUTE: u8 = 0xFE;
    /// Parity error during transfer
    pub const XFR_PARITY_ERROR: u8 = 0xFD;
    /// Overrun during transfer
    pub const XFR_OVERRUN: u8 = 0xFC;
    /// Hardware error
    pub const HW_ERROR: u8 = 0xFB;
    /// Bad ATR TS byte
    pub const BAD_ATR_TS: u8 = 0xF8;
    /// Bad ATR checksum
    pub const BAD_ATR_TCK: u8 = 0xF7;
    /// Card protocol not supported
    pub const ICC_PROTOCOL_NOT_SUPPORTED: u8 = 0xF6;
    /// Card class not supported
    pub const ICC_CLASS_NOT_SUPPORTED: u8 = 0xF5;
    /// Procedure byte conflict
    pub const PROCEDURE_BYTE_CONFLICT: u8 = 0xF4;
    /// Protocol deactivated
    pub const DEACTIVATED_PROTOCOL: u8 = 0xF3;
    /// Busy with an automatic sequence
    pub const BUSY_WITH_AUTO_SEQUENCE: u8 = 0xF2;
    /// Slot busy with another command
    pub const CMD_SLOT_BUSY: u8 = 0xE0;
}

/// Vendor escape commands understood during device bring-up
pub mod escape {
    /// Class byte of the reader's CONTROL commands
    pub const CLA: u8 = 0x58;
    /// GET_DATA instruction
    pub const INS_GET_DATA: u8 = 0x20;
    /// GET_SLOT_NAME instruction
    pub const INS_GET_SLOT_NAME: u8 = 0x21;
    /// GET_DATA identifier of the firmware revision string
    pub const ID_FIRMWARE_REVISION: u8 = 0x06;
}

/// Secure channel protocol bytes
pub mod secure {
    /// Protocol code prefixing every authentication message
    pub const PROTOCOL_CODE: u8 = 0x00;
    /// Version and mode byte selecting AES-128
    pub const VERSION_AES128: u8 = 0x01;
    /// Opcode reporting success
    pub const OPCODE_SUCCESS: u8 = 0x00;
    /// Opcode opening an authentication
    pub const OPCODE_AUTHENTICATE: u8 = 0x0A;
    /// Opcode announcing that more data follows
    pub const OPCODE_FOLLOWING: u8 = 0xFF;
    /// Length of an authentication step response (opcode + one AES block)
    pub const STEP_RESPONSE_SIZE: usize = 17;
}
