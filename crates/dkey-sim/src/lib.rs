//! Digital key scenario simulator.
//!
//! Drives a [`dkey_ble::DigitalKeyEngine`] against an in-process vehicle:
//! - [`Scenario`] - YAML description of the vehicle, the key and the steps
//! - [`LoopbackTransport`] - radio that posts every request to a channel
//! - [`SimVehicle`] - answers the handshake, commands and calibration
//! - [`Simulation`] - settles each step and collects a [`SimReport`]

mod loopback;
mod runner;
mod scenario;
mod vehicle;

pub use loopback::{LoopbackTransport, RadioOp};
pub use runner::{run_scenario, SimReport, Simulation};
pub use scenario::{decode_hex, KeyConfig, Scenario, SimError, SimResult, Step, VehicleConfig};
pub use vehicle::{SimVehicle, COMMAND_OK};
