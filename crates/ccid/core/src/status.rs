//! Decoding of the slot status and slot error bytes of a CCID response

use crate::constants::slot_error;

/// Presence and power state of the card in a slot (bmICCStatus)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IccStatus {
    /// Card present and powered
    Active,
    /// Card present but not powered
    Inactive,
    /// No card in the slot
    Absent,
}

/// Outcome of the command (bmCommandStatus)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Command processed without error
    Processed,
    /// Command failed, the error byte says why
    Failed,
    /// Reader asks for more time, the real answer follows
    TimeExtension,
}

/// Decoded slot status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus(u8);

impl SlotStatus {
    /// Wrap a raw status byte
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Build a status byte from its parts
    pub const fn from_parts(icc: IccStatus, command: CommandStatus) -> Self {
        let icc = match icc {
            IccStatus::Active => 0x00,
            IccStatus::Inactive => 0x01,
            IccStatus::Absent => 0x02,
        };
        let command = match command {
            CommandStatus::Processed => 0x00,
            CommandStatus::Failed => 0x40,
            CommandStatus::TimeExtension => 0x80,
        };
        Self(icc | command)
    }

    /// Raw byte
    pub const fn raw(&self) -> u8 {
        self.0
    }

    /// Card state
    pub const fn icc(&self) -> IccStatus {
        match self.0 & 0x03 {
            0x00 => IccStatus::Active,
            0x01 => IccStatus::Inactive,
            _ => IccStatus::Absent,
        }
    }

    /// Command state
    pub const fn command(&self) -> CommandStatus {
        match (self.0 >> 6) & 0x03 {
            0x00 => CommandStatus::Processed,
            0x01 => CommandStatus::Failed,
            _ => CommandStatus::TimeExtension,
        }
    }

    /// A card sits in the slot
    pub const fn card_present(&self) -> bool {
        !matches!(self.icc(), IccStatus::Absent)
    }

    /// The card in the slot is powered
    pub const fn card_powered(&self) -> bool {
        matches!(self.icc(), IccStatus::Active)
    }
}

/// Decoded slot error byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SlotError {
    /// Command not supported (error byte 0 with a failed command status)
    #[display("command not supported")]
    CommandNotSupported,
    /// Command aborted
    #[display("command aborted")]
    CommandAborted,
    /// Card mute or absent
    #[display("card is mute or absent")]
    IccMute,
    /// Parity error
    #[display("parity error during transfer")]
    XfrParityError,
    /// Overrun
    #[display("overrun during transfer")]
    XfrOverrun,
    /// Hardware error
    #[display("hardware error")]
    HardwareError,
    /// ATR rejected
    #[display("bad ATR")]
    BadAtr,
    /// Protocol or class not supported by the card
    #[display("card protocol not supported")]
    ProtocolNotSupported,
    /// Procedure byte conflict
    #[display("procedure byte conflict")]
    ProcedureByteConflict,
    /// Protocol deactivated
    #[display("protocol deactivated")]
    DeactivatedProtocol,
    /// Slot busy
    #[display("slot is busy")]
    SlotBusy,
    /// Any other code
    #[display("slot error {_0:#04X}")]
    Other(u8),
}

impl SlotError {
    /// Decode a slot error byte
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::CommandNotSupported,
            slot_error::CMD_ABORTED => Self::CommandAborted,
            slot_error::ICC_MUTE => Self::IccMute,
            slot_error::XFR_PARITY_ERROR => Self::XfrParityError,
            slot_error::XFR_OVERRUN => Self::XfrOverrun,
            slot_error::HW_ERROR => Self::HardwareError,
            slot_error::BAD_ATR_TS | slot_error::BAD_ATR_TCK => Self::BadAtr,
            slot_error::ICC_PROTOCOL_NOT_SUPPORTED | slot_error::ICC_CLASS_NOT_SUPPORTED => {
                Self::ProtocolNotSupported
            }
            slot_error::PROCEDURE_BYTE_CONFLICT => Self::ProcedureByteConflict,
            slot_error::DEACTIVATED_PROTOCOL => Self::DeactivatedProtocol,
            slot_error::CMD_SLOT_BUSY | slot_error::BUSY_WITH_AUTO_SEQUENCE => Self::SlotBusy,
            other => Self::Other(other),
        }
    }

    /// Interpret the status and error bytes of a response.
    ///
    /// Returns `None` when the command succeeded. A time extension is never an error.
    pub const fn check(status: SlotStatus, error: u8) -> Option<Self> {
        match status.command() {
            CommandStatus::TimeExtension => None,
            CommandStatus::Failed => Some(Self::from_code(error)),
            CommandStatus::Processed if error != 0 => Some(Self::from_code(error)),
            CommandStatus::Processed => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icc_status_bits() {
        assert_eq!(SlotStatus::new(0x00).icc(), IccStatus::Active);
        assert_eq!(SlotStatus::new(0x01).icc(), IccStatus::Inactive);
        assert_eq!(SlotStatus::new(0x02).icc(), IccStatus::Absent);
        assert!(SlotStatus::new(0x41).card_present());
        assert!(!SlotStatus::new(0x41).card_powered());
        assert!(!SlotStatus::new(0x42).card_present());
    }

    #[test]
    fn test_command_status_bits() {
        assert_eq!(SlotStatus::new(0x00).command(), CommandStatus::Processed);
        assert_eq!(SlotStatus::new(0x42).command(), CommandStatus::Failed);
        assert_eq!(SlotStatus::new(0x80).command(), CommandStatus::TimeExtension);
        let status = SlotStatus::from_parts(IccStatus::Inactive, CommandStatus::Failed);
        assert_eq!(status.raw(), 0x41);
    }

    #[test]
    fn test_slot_error_check() {
        let ok = SlotStatus::from_parts(IccStatus::Active, CommandStatus::Processed);
        assert_eq!(SlotError::check(ok, 0x00), None);
        assert_eq!(SlotError::check(ok, 0xFE), Some(SlotError::IccMute));

        let failed = SlotStatus::from_parts(IccStatus::Absent, CommandStatus::Failed);
        assert_eq!(
            SlotError::check(failed, 0x00),
            Some(SlotError::CommandNotSupported)
        );

        // Error byte carries the BWT multiplier for a time extension
        let wait = SlotStatus::from_parts(IccStatus::Active, CommandStatus::TimeExtension);
        assert_eq!(SlotError::check(wait, 0x02), None);
    }
}
