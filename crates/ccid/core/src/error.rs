//! Error types for frame decoding and the secure channel

/// Result type for CCID operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while decoding a CCID frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than a header
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// Length field disagrees with the payload actually present
    #[error("length field announces {declared} bytes but {actual} are present")]
    LengthMismatch {
        /// Length announced by the header (ciphered flag masked)
        declared: usize,
        /// Payload bytes found after the header
        actual: usize,
    },

    /// Length field exceeds what the codec accepts
    #[error("payload of {0} bytes exceeds the maximum frame size")]
    PayloadTooLarge(usize),

    /// Unknown message code
    #[error("unknown message code {0:#04X}")]
    UnknownCode(u8),
}

/// Core error type for the CCID codec and secure channel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed frame
    #[error("Malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// Mutual authentication failed
    #[error("Authentication failed at step {step}: {reason}")]
    Authentication {
        /// Handshake step (1 or 3) at which the failure was detected
        step: u8,
        /// What went wrong
        reason: AuthFailure,
    },

    /// CMAC of a received frame does not match
    #[error("CMAC is invalid (wrong session key?)")]
    CmacInvalid,

    /// Decrypted payload does not end with the expected padding
    #[error("Padding is invalid (decryption failed/wrong session key?)")]
    PaddingInvalid,

    /// Data of unexpected length
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Secure channel used before authentication completed
    #[error("Secure channel not established")]
    NotAuthenticated,
}

impl Error {
    /// Whether the error signals a secure channel integrity failure
    pub const fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::CmacInvalid | Self::PaddingInvalid)
    }

    /// Whether the error comes from the mutual authentication
    pub const fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    pub(crate) const fn auth(step: u8, reason: AuthFailure) -> Self {
        Self::Authentication { step, reason }
    }
}

/// Reason a mutual authentication step was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum AuthFailure {
    /// Response is shorter than an opcode
    #[display("response is too short")]
    TooShort,
    /// The device answered with an error opcode
    #[display("the device has reported an error: {_0:#04X}")]
    DeviceError(u8),
    /// Response does not have the expected length
    #[display("response does not have the expected format")]
    BadFormat,
    /// The peer's cryptogram does not match our nonce
    #[display("cryptogram is invalid")]
    BadCryptogram,
    /// Message received out of order
    #[display("unexpected message for the current step")]
    OutOfSequence,
    /// Unsupported protocol version or key selection
    #[display("unsupported protocol parameters")]
    Unsupported,
}
