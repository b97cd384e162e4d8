//! Engine error types.

use crate::{CalibrationKind, ConnectionState};
use dkey_frame::{DecodeError, EncodeError, MaskError};
use dkey_keys::ServiceError;
use thiserror::Error;

/// Why a handshake round was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Vehicle or mobile signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// Key-confirmation tag did not verify.
    #[error("bad key confirmation")]
    BadConfirmation,

    /// Peer challenge was seen before or echoes ours.
    #[error("replayed challenge")]
    ReplayedChallenge,

    /// Message could not be parsed.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// More rounds than the scheme allows.
    #[error("round count exceeded")]
    RoundCountExceeded,

    /// Valid message of the wrong kind for this round.
    #[error("unexpected message type 0x{0:02X}")]
    UnexpectedMessage(u8),

    /// Peer is not trusted by the installed key.
    #[error("untrusted peer")]
    UntrustedPeer,

    /// Vehicle completed the exchange but refused the key.
    #[error("vehicle refused with status {0}")]
    VehicleRefused(u8),
}

impl RejectReason {
    /// Short machine-friendly name, used for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::BadSignature => "bad_signature",
            RejectReason::BadConfirmation => "bad_confirmation",
            RejectReason::ReplayedChallenge => "replayed_challenge",
            RejectReason::Malformed(_) => "malformed",
            RejectReason::RoundCountExceeded => "round_count_exceeded",
            RejectReason::UnexpectedMessage(_) => "unexpected_message",
            RejectReason::UntrustedPeer => "untrusted_peer",
            RejectReason::VehicleRefused(_) => "vehicle_refused",
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Radio adapter is off, resetting, unauthorized or unsupported.
    #[error("radio unavailable")]
    RadioUnavailable,

    /// Scan window ended without finding the vehicle.
    #[error("vehicle not found")]
    PeripheralNotFound,

    /// Link could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Link teardown failed. The session is released regardless.
    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),

    /// Handshake did not finish within the configured bound.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A handshake round failed validation.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(RejectReason),

    /// Session was torn down while the handshake was running.
    #[error("handshake cancelled")]
    HandshakeCancelled,

    /// Command requires an authenticated session.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Installed key does not grant this permission mask.
    #[error("permission denied for mask 0x{0}")]
    PermissionDenied(String),

    /// Identical command sent again inside the dedup window.
    #[error("duplicate command")]
    DuplicateCommand,

    /// Outbound queue is full.
    #[error("outbound queue full ({0} frames)")]
    QueueFull(usize),

    /// Transport refused an operation synchronously.
    #[error("transport error: {0}")]
    Transport(String),

    /// Received or supplied bytes did not decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Frame could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Permission mask text did not parse.
    #[error(transparent)]
    Mask(#[from] MaskError),

    /// A calibration is already open on this session.
    #[error("calibration already in progress")]
    CalibrationInProgress,

    /// Submitted value kind does not fit the open calibration.
    #[error("calibration mismatch: open for {open}, got {requested}")]
    CalibrationMismatch {
        /// Kind the calibration is at.
        open: CalibrationKind,
        /// Kind that was submitted.
        requested: CalibrationKind,
    },

    /// No calibration is open.
    #[error("no calibration in progress")]
    NoCalibration,

    /// Operation not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State the engine was in.
        state: ConnectionState,
    },

    /// No digital key is selected.
    #[error("no digital key selected")]
    NoDigitalKey,

    /// Installed key cannot be used for a handshake.
    #[error("invalid digital key: {0}")]
    InvalidKey(String),

    /// Key lifecycle backend call failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Short machine-friendly name, used for metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::RadioUnavailable => "radio_unavailable",
            EngineError::PeripheralNotFound => "not_found",
            EngineError::ConnectFailed(_) => "connect_failed",
            EngineError::DisconnectFailed(_) => "disconnect_failed",
            EngineError::HandshakeTimeout => "handshake_timeout",
            EngineError::HandshakeRejected(_) => "handshake_rejected",
            EngineError::HandshakeCancelled => "handshake_cancelled",
            EngineError::NotAuthenticated => "not_authenticated",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::DuplicateCommand => "duplicate",
            EngineError::QueueFull(_) => "queue_full",
            EngineError::Transport(_) => "transport",
            EngineError::Decode(_) => "decode",
            EngineError::Encode(_) => "encode",
            EngineError::Mask(_) => "mask",
            EngineError::CalibrationInProgress => "calibration_in_progress",
            EngineError::CalibrationMismatch { .. } => "calibration_mismatch",
            EngineError::NoCalibration => "no_calibration",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::NoDigitalKey => "no_digital_key",
            EngineError::InvalidKey(_) => "invalid_key",
            EngineError::Service(_) => "service",
            EngineError::Config(_) => "config",
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::HandshakeRejected(RejectReason::BadSignature);
        assert_eq!(err.to_string(), "handshake rejected: bad signature");

        let err = EngineError::InvalidState {
            operation: "connect",
            state: ConnectionState::Scanning,
        };
        assert_eq!(err.to_string(), "cannot connect while scanning");

        let err: EngineError = DecodeError::UnknownType(9).into();
        assert_eq!(err.to_string(), "unknown command type: 0x09");
        assert_eq!(err.kind(), "decode");
    }
}
