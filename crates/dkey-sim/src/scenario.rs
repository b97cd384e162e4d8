//! Scenario files.
//!
//! A scenario names the vehicle, the key the phone holds, the engine
//! configuration, and the steps to run:
//!
//! ```yaml
//! vehicle:
//!   name: DKEY-SIM-0001
//!   vin: LSIM0000000000001
//!   seed: "1111111111111111111111111111111111111111111111111111111111111111"
//! key:
//!   dk_id: dk-sim-0001
//!   seed: "2222222222222222222222222222222222222222222222222222222222222222"
//!   near_masks: ["0x03"]
//! steps:
//!   - action: wake_up
//!   - action: control
//!     mask: "0x01"
//!     payload: "1001"
//!   - action: disconnect
//! ```

use dkey_ble::EngineConfig;
use dkey_keys::{
    DigitalKeyInfo, DigitalKeyStatus, KeyMaterial, KeyRole, Permission, PermissionScope,
};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or running a scenario.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("engine error: {0}")]
    Engine(#[from] dkey_ble::EngineError),

    #[error("backend error: {0}")]
    Service(#[from] dkey_keys::ServiceError),

    #[error("invalid scenario: {0}")]
    Invalid(String),

    #[error("step {index} ({action}) failed: {reason}")]
    StepFailed {
        index: usize,
        action: &'static str,
        reason: String,
    },
}

/// Result type for the simulator.
pub type SimResult<T> = Result<T, SimError>;

/// The simulated vehicle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleConfig {
    /// Advertised name.
    pub name: String,
    /// Peripheral address.
    #[serde(default = "default_address")]
    pub address: String,
    /// Vehicle identification number.
    pub vin: String,
    /// Hex signing seed (32 bytes).
    pub seed: String,
    /// Hex reference value reported when calibration starts.
    #[serde(default = "default_reference")]
    pub reference: String,
    /// Status byte of the final handshake message; nonzero refuses.
    #[serde(default)]
    pub result_status: u8,
    /// Flip the last byte of this handshake reply (0-based).
    #[serde(default)]
    pub tamper_round: Option<usize>,
    /// Never answer the handshake.
    #[serde(default)]
    pub silent: bool,
}

fn default_address() -> String {
    "C0:FF:EE:00:00:01".to_string()
}

fn default_reference() -> String {
    "42".to_string()
}

/// The key the phone holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// Digital key id.
    pub dk_id: String,
    /// Hex signing seed (32 bytes).
    pub seed: String,
    /// Near-field permission masks granted by the key.
    #[serde(default)]
    pub near_masks: Vec<String>,
    /// Platform seed the device fingerprint is derived from.
    #[serde(default = "default_device_seed")]
    pub device_seed: String,
}

fn default_device_seed() -> String {
    "dkey-sim-device".to_string()
}

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    /// Scan, connect and authenticate in one call.
    WakeUp,
    /// Scan and connect explicitly.
    Connect,
    /// Send a control command.
    Control {
        /// Hex permission mask.
        mask: String,
        /// Hex payload.
        #[serde(default)]
        payload: String,
    },
    /// Send pass-through data.
    Transfer {
        /// Hex payload.
        payload: String,
    },
    /// Resend the last control or transfer command as a retry.
    Retry,
    /// Run a PE then PS calibration and upload the result.
    Calibrate {
        /// Vehicle model code for the upload.
        mode_code: String,
        /// Hex PE value.
        pe: String,
        /// Hex PS value.
        ps: String,
    },
    /// Report entering or leaving the vehicle's region.
    Region {
        /// Whether the phone is inside.
        inside: bool,
        /// Turn auto wake-up on before reporting.
        #[serde(default)]
        auto_wake: bool,
    },
    /// Let time pass, driving timeouts.
    Wait {
        /// Seconds to advance.
        secs: u64,
    },
    /// Tear down the link.
    Disconnect,
}

impl Step {
    /// Action name as written in scenario files.
    pub fn action(&self) -> &'static str {
        match self {
            Step::WakeUp => "wake_up",
            Step::Connect => "connect",
            Step::Control { .. } => "control",
            Step::Transfer { .. } => "transfer",
            Step::Retry => "retry",
            Step::Calibrate { .. } => "calibrate",
            Step::Region { .. } => "region",
            Step::Wait { .. } => "wait",
            Step::Disconnect => "disconnect",
        }
    }
}

/// A complete scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Simulated vehicle.
    pub vehicle: VehicleConfig,
    /// Key on the phone.
    pub key: KeyConfig,
    /// Steps to run in order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Parse a scenario from YAML.
    pub fn from_yaml_str(yaml: &str) -> SimResult<Self> {
        let scenario: Scenario = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load a scenario file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Check the scenario can be run.
    pub fn validate(&self) -> SimResult<()> {
        self.engine.validate()?;
        self.vehicle_seed()?;
        self.key_seed()?;
        if decode_hex("vehicle.reference", &self.vehicle.reference)?.len() > u8::MAX as usize {
            return Err(SimError::Invalid("vehicle.reference longer than 255 bytes".to_string()));
        }
        if !self.vehicle.name.starts_with(&self.engine.ble.name_prefix) {
            return Err(SimError::Invalid(format!(
                "vehicle name {} does not match prefix {}",
                self.vehicle.name, self.engine.ble.name_prefix
            )));
        }
        Ok(())
    }

    /// Vehicle signing seed.
    pub fn vehicle_seed(&self) -> SimResult<[u8; 32]> {
        decode_seed("vehicle.seed", &self.vehicle.seed)
    }

    /// Phone signing seed.
    pub fn key_seed(&self) -> SimResult<[u8; 32]> {
        decode_seed("key.seed", &self.key.seed)
    }

    /// Public key the vehicle trusts for the phone's key.
    pub fn key_public(&self) -> SimResult<[u8; 32]> {
        Ok(SigningKey::from_bytes(&self.key_seed()?)
            .verifying_key()
            .to_bytes())
    }

    /// Backend record for the phone's key.
    pub fn key_info(&self) -> DigitalKeyInfo {
        DigitalKeyInfo {
            dk_id: self.key.dk_id.clone(),
            vin: self.vehicle.vin.clone(),
            key_type: KeyRole::Owner,
            status: DigitalKeyStatus::NonDownload,
            permission_list: self
                .key
                .near_masks
                .iter()
                .map(|mask| Permission {
                    permission_mask: mask.clone(),
                    permission_description: String::new(),
                    permission_type: PermissionScope::Near,
                    is_choice: true,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Secret material for the phone's key.
    pub fn key_material(&self, vehicle_public_key: [u8; 32]) -> SimResult<KeyMaterial> {
        Ok(KeyMaterial::new(self.key_seed()?, vehicle_public_key))
    }
}

/// Decode a hex string, accepting an optional `0x` prefix.
pub fn decode_hex(field: &str, value: &str) -> SimResult<Vec<u8>> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|e| SimError::Invalid(format!("{}: {}", field, e)))
}

fn decode_seed(field: &str, value: &str) -> SimResult<[u8; 32]> {
    let bytes = decode_hex(field, value)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| SimError::Invalid(format!("{}: expected 32 bytes, got {}", field, b.len())))
}
