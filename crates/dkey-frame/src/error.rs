//! Error types for frame encoding and decoding.

use thiserror::Error;

/// Errors that can occur while decoding a received frame.
///
/// Decoding never panics; every malformed input maps to one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame is shorter than its header claims.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },

    /// Leading tag is not a known command type.
    #[error("unknown command type: 0x{0:02X}")]
    UnknownType(u8),

    /// Structure or authentication tag did not verify.
    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    /// Frame requires a session key that is not available.
    #[error("decryption failed: {0}")]
    DecryptFailure(String),
}

impl DecodeError {
    /// Create a too-short error.
    pub fn too_short(expected: usize, actual: usize) -> Self {
        DecodeError::TooShort { expected, actual }
    }

    /// Short machine-friendly name, used for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::TooShort { .. } => "too_short",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::IntegrityFailure(_) => "integrity",
            DecodeError::DecryptFailure(_) => "decrypt",
        }
    }
}

/// Errors that can occur while encoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The frame type is encrypted but no session key is installed.
    #[error("no session key installed for {0} frame")]
    MissingSessionKey(&'static str),

    /// Payload does not fit the length field.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Cipher failure.
    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// Errors parsing a permission mask from text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskError {
    /// Not a valid hex string.
    #[error("invalid permission mask hex: {0}")]
    InvalidHex(String),

    /// Mask longer than the one-byte length field allows.
    #[error("permission mask too long: {0} bytes")]
    TooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::too_short(6, 2);
        assert!(err.to_string().contains("at least 6"));

        let err = DecodeError::UnknownType(0x7E);
        assert_eq!(err.to_string(), "unknown command type: 0x7E");
        assert_eq!(err.kind(), "unknown_type");
    }
}
