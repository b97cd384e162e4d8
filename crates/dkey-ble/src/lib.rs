//! BLE connection and authentication engine for vehicle digital keys.
//!
//! This crate provides:
//! - [`DigitalKeyEngine`] - the connection state machine for one vehicle
//!   link: scanning, connecting, the mutual-authentication handshake,
//!   command dispatch, calibration and proactive wake-up
//! - [`Transport`] - the radio boundary, with [`RecordingTransport`] for
//!   tests and simulation
//! - [`KeyAgreement`] - the handshake seam, implemented by
//!   [`SignedEcdhHandshake`] on the phone and [`VehicleResponder`] on the
//!   vehicle side
//!
//! The engine does no IO of its own. The host drives it with transport
//! completions (`on_connected`, `on_data`, `on_write_complete`, ...) and a
//! periodic [`DigitalKeyEngine::poll_timeouts`], and reads [`SessionEvent`]s
//! from the channel returned by [`DigitalKeyEngine::new`].

pub mod calibration;
mod config;
mod dispatcher;
mod engine;
mod error;
mod events;
pub mod handshake;
mod identity;
mod region;
mod session;
mod state;
mod transport;

pub use calibration::{CalibrationEvent, CalibrationKind, CalibrationSession};
pub use config::{
    parse_ble_uuid, short_uuid, BleConfig, DispatcherConfig, EngineConfig, HandshakeConfig,
    BLUETOOTH_BASE_UUID,
};
pub use dispatcher::{Dispatcher, Outbound};
pub use engine::{DigitalKeyEngine, HandshakeFactory};
pub use error::{EngineError, EngineResult, RejectReason};
pub use events::{HandshakeEvent, SessionEvent};
pub use handshake::{
    ChallengeLedger, KeyAgreement, RoundOutcome, SignedEcdhHandshake, VehicleResponder,
};
pub use identity::DeviceFingerprint;
pub use region::{RegionChange, RegionMonitor, RegionState};
pub use session::BleSession;
pub use state::{AdapterStatus, BleStatus, ConnectionState, RadioAvailability};
pub use transport::{Peripheral, RecordingTransport, Transport, TransportError};
