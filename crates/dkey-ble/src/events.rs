//! Events delivered to the application.

use crate::calibration::CalibrationEvent;
use crate::region::RegionState;
use crate::{BleStatus, EngineError, EngineResult};
use dkey_frame::{CommandFrame, CommandType, DecodeError};

/// Handshake progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// A round was accepted; the carried frame was queued for the vehicle.
    Process(Vec<u8>),
    /// Session key installed.
    Success,
    /// The attempt ended without a key.
    Failure(EngineError),
}

/// Everything the engine reports, in the order the triggering inputs
/// arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Externally visible status changed.
    Status(BleStatus),
    /// Handshake progress.
    Handshake(HandshakeEvent),
    /// Outcome of `connect()`.
    Connect(EngineResult<()>),
    /// Outcome of `disconnect()`.
    Disconnect(EngineResult<()>),
    /// An inbound frame, or why it could not be decoded.
    Receive(Result<CommandFrame, DecodeError>),
    /// Completion of a frame submitted with `send`, `retry` or `send_encoded`.
    Sent(EngineResult<CommandType>),
    /// Calibration progress.
    Calibration(CalibrationEvent),
    /// Region transition.
    Region(RegionState),
    /// Outcome of `wake_up()`.
    WakeUp(EngineResult<()>),
}
