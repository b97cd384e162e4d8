//! Engine configuration.
//!
//! Loaded from YAML:
//!
//! ```yaml
//! ble:
//!   service_uuid: "0000fff0-0000-1000-8000-00805f9b34fb"
//!   read_uuid: "fff1"
//!   write_uuid: "fff2"
//!   name_prefix: "DK-"
//!   scan_timeout_secs: 10
//! handshake:
//!   timeout_secs: 30
//! dispatcher:
//!   dedup_window_ms: 500
//!   max_queue: 32
//! ```
//!
//! 16-bit and 32-bit short UUIDs are expanded onto the Bluetooth base UUID.

use crate::{EngineError, EngineResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Default bound on the whole handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Default scan window.
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 10;

/// Radio service and characteristic configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BleConfig {
    /// GATT service advertised by the vehicle.
    #[serde(deserialize_with = "deserialize_ble_uuid")]
    pub service_uuid: Uuid,
    /// Characteristic the vehicle notifies on.
    #[serde(deserialize_with = "deserialize_ble_uuid")]
    pub read_uuid: Uuid,
    /// Characteristic this side writes to.
    #[serde(deserialize_with = "deserialize_ble_uuid")]
    pub write_uuid: Uuid,
    /// Advertised name prefix identifying the target vehicle.
    #[serde(default)]
    pub name_prefix: String,
    /// How long a scan runs before reporting not-found.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

fn default_scan_timeout() -> u64 {
    DEFAULT_SCAN_TIMEOUT_SECS
}

impl Default for BleConfig {
    fn default() -> Self {
        BleConfig {
            service_uuid: short_uuid(0xfff0),
            read_uuid: short_uuid(0xfff1),
            write_uuid: short_uuid(0xfff2),
            name_prefix: String::new(),
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
        }
    }
}

/// Handshake configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeConfig {
    /// Bound from auth-start to a definitive outcome.
    #[serde(default = "default_handshake_timeout")]
    pub timeout_secs: u64,
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

/// Outbound command dispatch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DispatcherConfig {
    /// Window in which an identical non-retry command is refused.
    pub dedup_window_ms: u64,
    /// Frames allowed to wait behind the in-flight write.
    pub max_queue: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            dedup_window_ms: 500,
            max_queue: 32,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Radio configuration.
    #[serde(default)]
    pub ble: BleConfig,
    /// Handshake configuration.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Dispatcher configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl EngineConfig {
    /// Parse and validate a YAML configuration.
    pub fn from_yaml_str(yaml: &str) -> EngineResult<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&yaml)
    }

    /// Check value ranges.
    pub fn validate(&self) -> EngineResult<()> {
        if self.ble.read_uuid == self.ble.write_uuid {
            return Err(EngineError::Config(
                "read_uuid and write_uuid must differ".to_string(),
            ));
        }
        if self.handshake.timeout_secs == 0 {
            return Err(EngineError::Config("handshake.timeout_secs must be > 0".to_string()));
        }
        if self.ble.scan_timeout_secs == 0 {
            return Err(EngineError::Config("ble.scan_timeout_secs must be > 0".to_string()));
        }
        if self.dispatcher.max_queue == 0 {
            return Err(EngineError::Config("dispatcher.max_queue must be > 0".to_string()));
        }
        Ok(())
    }

    /// Handshake bound as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake.timeout_secs)
    }

    /// Scan window as a duration.
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.ble.scan_timeout_secs)
    }

    /// Dedup window as a duration.
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dispatcher.dedup_window_ms)
    }
}

/// Bluetooth base UUID, `00000000-0000-1000-8000-00805f9b34fb`.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

/// Expand a 16-bit or 32-bit assigned number onto the base UUID.
pub fn short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | (u128::from(short) << 96))
}

/// Parse a UUID, accepting `fff0`-style 16-bit and 8-digit 32-bit short forms.
pub fn parse_ble_uuid(s: &str) -> EngineResult<Uuid> {
    let invalid = || EngineError::Config(format!("invalid UUID '{}'", s));
    match s.len() {
        4 | 8 => {
            if !s.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            let short = u32::from_str_radix(s, 16).map_err(|_| invalid())?;
            Ok(short_uuid(short))
        }
        _ => Uuid::parse_str(s).map_err(|_| invalid()),
    }
}

fn deserialize_ble_uuid<'de, D>(deserializer: D) -> Result<Uuid, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_ble_uuid(&s).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
ble:
  service_uuid: "fff0"
  read_uuid: "fff1"
  write_uuid: "fff2"
  name_prefix: "DK-"
handshake:
  timeout_secs: 12
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ble.name_prefix, "DK-");
        assert_eq!(config.ble.read_uuid, short_uuid(0xfff1));
        assert_eq!(config.ble.scan_timeout_secs, DEFAULT_SCAN_TIMEOUT_SECS);
        assert_eq!(config.handshake.timeout_secs, 12);
        assert_eq!(config.dispatcher, DispatcherConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "handshake:\n  timeout: 5\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(yaml),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            parse_ble_uuid("fff0").unwrap().to_string(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            parse_ble_uuid("1234ABCD").unwrap().to_string(),
            "1234abcd-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            parse_ble_uuid("0000FFF1-0000-1000-8000-00805F9B34FB").unwrap(),
            short_uuid(0xfff1)
        );
        assert!(parse_ble_uuid("not-a-uuid").is_err());
        assert!(parse_ble_uuid("+fff").is_err());
        assert!(parse_ble_uuid("").is_err());
    }

    #[test]
    fn test_bad_uuid_rejected_on_load() {
        let yaml = "ble:\n  service_uuid: \"not-a-uuid\"\n  read_uuid: \"fff1\"\n  write_uuid: \"fff2\"\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(yaml),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_short_and_long_forms_collide() {
        let yaml = r#"
ble:
  service_uuid: "fff0"
  read_uuid: "fff1"
  write_uuid: "0000FFF1-0000-1000-8000-00805f9b34fb"
"#;
        assert!(matches!(
            EngineConfig::from_yaml_str(yaml),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {

        let mut config = EngineConfig::default();
        config.handshake.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.ble.write_uuid = config.ble.read_uuid;
        assert!(config.validate().is_err());
    }
}
