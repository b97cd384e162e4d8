//! Records exchanged with the key lifecycle backend.
//!
//! Field names follow the backend's camelCase JSON. Enumerated fields travel
//! as integers (or, for the permission scope, as numeric strings).

use crate::KeyError;
use dkey_frame::PermissionMask;
use serde::{Deserialize, Serialize};

// ============================================================================
// Enumerations
// ============================================================================

/// Lifecycle status of a digital key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DigitalKeyStatus {
    /// Status not known.
    #[default]
    Unknown,
    /// Key is valid and present on this device.
    Normal,
    /// Temporarily frozen by the owner.
    Frozen,
    /// Revoked; see [`KeyChangeStatus`] for the reason.
    Revoked,
    /// Validity window has passed.
    Expired,
    /// Owner key not yet activated.
    NonActivated,
    /// Issued but not downloaded to any device.
    NonDownload,
    /// Shared key that is valid but downloaded to another device.
    Downloaded,
}

impl DigitalKeyStatus {
    /// Whether the key can be used to open a session.
    pub fn is_usable(self) -> bool {
        matches!(self, DigitalKeyStatus::Normal)
    }

    /// Whether the key is permanently or temporarily unusable.
    pub fn is_invalid(self) -> bool {
        matches!(
            self,
            DigitalKeyStatus::Frozen | DigitalKeyStatus::Revoked | DigitalKeyStatus::Expired
        )
    }
}

impl TryFrom<u8> for DigitalKeyStatus {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DigitalKeyStatus::Unknown),
            1 => Ok(DigitalKeyStatus::Normal),
            2 => Ok(DigitalKeyStatus::Frozen),
            3 => Ok(DigitalKeyStatus::Revoked),
            4 => Ok(DigitalKeyStatus::Expired),
            5 => Ok(DigitalKeyStatus::NonActivated),
            6 => Ok(DigitalKeyStatus::NonDownload),
            10 => Ok(DigitalKeyStatus::Downloaded),
            value => Err(KeyError::UnknownValue { field: "status", value }),
        }
    }
}

impl From<DigitalKeyStatus> for u8 {
    fn from(status: DigitalKeyStatus) -> u8 {
        match status {
            DigitalKeyStatus::Unknown => 0,
            DigitalKeyStatus::Normal => 1,
            DigitalKeyStatus::Frozen => 2,
            DigitalKeyStatus::Revoked => 3,
            DigitalKeyStatus::Expired => 4,
            DigitalKeyStatus::NonActivated => 5,
            DigitalKeyStatus::NonDownload => 6,
            DigitalKeyStatus::Downloaded => 10,
        }
    }
}

/// Reason a key was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum KeyChangeStatus {
    /// No change.
    #[default]
    Normal,
    /// Deleted by the driver.
    Deleted,
    /// Vehicle changed owner.
    OwnerChanged,
}

impl TryFrom<u8> for KeyChangeStatus {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyChangeStatus::Normal),
            1 => Ok(KeyChangeStatus::Deleted),
            2 => Ok(KeyChangeStatus::OwnerChanged),
            value => Err(KeyError::UnknownValue { field: "changeStatus", value }),
        }
    }
}

impl From<KeyChangeStatus> for u8 {
    fn from(status: KeyChangeStatus) -> u8 {
        match status {
            KeyChangeStatus::Normal => 0,
            KeyChangeStatus::Deleted => 1,
            KeyChangeStatus::OwnerChanged => 2,
        }
    }
}

/// Identity a key was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum KeyRole {
    /// Vehicle owner.
    #[default]
    Owner,
    /// Family member or friend.
    Family,
    /// Temporary guest.
    Temporary,
    /// Dealer test drive.
    TestDrive,
    /// Rental customer.
    Rental,
}

impl TryFrom<u8> for KeyRole {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(KeyRole::Owner),
            1 => Ok(KeyRole::Family),
            2 => Ok(KeyRole::Temporary),
            3 => Ok(KeyRole::TestDrive),
            4 => Ok(KeyRole::Rental),
            value => Err(KeyError::UnknownValue { field: "keyType", value }),
        }
    }
}

impl From<KeyRole> for u8 {
    fn from(role: KeyRole) -> u8 {
        role as u8
    }
}

/// Filter for shared-key listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyListFilter {
    /// Every key.
    #[default]
    All,
    /// Keys that can currently be used.
    Valid,
    /// Frozen, revoked or expired keys.
    Invalid,
}

impl KeyListFilter {
    /// Whether `info` passes this filter.
    pub fn matches(self, info: &DigitalKeyInfo) -> bool {
        match self {
            KeyListFilter::All => true,
            KeyListFilter::Valid => !info.status.is_invalid(),
            KeyListFilter::Invalid => info.status.is_invalid(),
        }
    }
}

/// Whether a permission applies at close range or remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionScope {
    /// Near-field control over BLE.
    #[serde(rename = "1")]
    Near,
    /// Remote control through the backend.
    #[serde(rename = "2")]
    Remote,
}

// ============================================================================
// Records
// ============================================================================

/// One capability a key may be granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Hex capability mask, e.g. `"0x01"`.
    pub permission_mask: String,
    /// Human-readable description.
    #[serde(default)]
    pub permission_description: String,
    /// Near or remote.
    pub permission_type: PermissionScope,
    /// Whether the permission is selected when sharing.
    #[serde(default)]
    pub is_choice: bool,
}

impl Permission {
    /// Parse the capability mask.
    pub fn mask(&self) -> Result<PermissionMask, KeyError> {
        PermissionMask::parse_hex(&self.permission_mask)
            .map_err(|e| KeyError::InvalidRecord(e.to_string()))
    }
}

/// A digital key record as issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalKeyInfo {
    /// Digital key id.
    #[serde(rename = "dkID")]
    pub dk_id: String,
    /// Device the key is bound to.
    #[serde(default)]
    pub mobile_id: String,
    /// Sharer's phone number.
    #[serde(default)]
    pub phone_number: String,
    /// Start of the validity window.
    #[serde(default)]
    pub start_time: String,
    /// End of the validity window.
    #[serde(default)]
    pub end_time: String,
    /// Activation or share request time.
    #[serde(default)]
    pub request_time: String,
    /// Identity the key was issued for.
    #[serde(default)]
    pub key_type: KeyRole,
    /// Granted permissions.
    #[serde(default)]
    pub permission_list: Vec<Permission>,
    /// Remaining uses.
    #[serde(default)]
    pub times: i32,
    /// Whether the key has been downloaded.
    #[serde(default, with = "int_bool")]
    pub is_download: bool,
    /// Vehicle identification number.
    pub vin: String,
    /// Owning user.
    #[serde(default)]
    pub user_id: String,
    /// Lifecycle status.
    #[serde(default)]
    pub status: DigitalKeyStatus,
    /// Revocation reason.
    #[serde(default)]
    pub change_status: KeyChangeStatus,
}

impl DigitalKeyInfo {
    /// Parse a record from backend JSON.
    pub fn from_json(json: &str) -> Result<Self, KeyError> {
        serde_json::from_str(json).map_err(|e| KeyError::InvalidRecord(e.to_string()))
    }

    /// Masks of every near-field permission on this key.
    ///
    /// Remote permissions are enforced by the backend and never gate BLE
    /// commands. Unparseable masks are skipped.
    pub fn near_masks(&self) -> Vec<PermissionMask> {
        self.permission_list
            .iter()
            .filter(|p| p.permission_type == PermissionScope::Near)
            .filter_map(|p| p.mask().ok())
            .collect()
    }
}

/// A device bound to a vehicle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    /// Device id.
    pub mobile_id: String,
    /// User-assigned device name.
    pub mobile_name: String,
    /// Manufacturer.
    pub mobile_brand: String,
    /// Model.
    pub mobile_model: String,
    /// OS version.
    pub os_version: String,
    /// When the device was bound.
    pub bind_time: String,
}

/// Share quota for a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareQuota {
    /// Maximum number of shared keys.
    pub max_amount: u32,
    /// Keys shared so far.
    pub use_amount: u32,
    /// Keys that can still be shared.
    pub available: u32,
}

/// Parameters for sharing a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRequest {
    /// Permissions granted to the recipient.
    pub permissions: Vec<Permission>,
    /// Start of the validity window.
    pub start_time: String,
    /// End of the validity window.
    pub end_time: String,
    /// Identity of the recipient. `Owner` is not shareable.
    pub key_type: KeyRole,
    /// Number of uses allowed.
    pub times: i32,
    /// Recipient identifiers (phone numbers).
    pub recipients: Vec<String>,
}

/// Owner key status lookup result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerKeyStatus {
    /// Status of the owner key.
    pub status: DigitalKeyStatus,
    /// Owner key id.
    #[serde(rename = "dkID")]
    pub dk_id: String,
}

/// Page selector for list calls. Pages start at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Page number.
    pub number: u32,
    /// Entries per page.
    pub size: u32,
}

impl Page {
    /// First page of `size` entries.
    pub fn first(size: u32) -> Self {
        Page { number: 0, size }
    }

    /// Apply the page to an in-memory list.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip((self.number as usize).saturating_mul(self.size as usize))
            .take(self.size as usize)
            .cloned()
            .collect()
    }
}

/// Calibration values collected for one vehicle model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRecord {
    /// Vehicle model code.
    pub vehicle_mode_code: String,
    /// PE reference value.
    #[serde(with = "hex_bytes")]
    pub pe: Vec<u8>,
    /// PS reference value.
    #[serde(with = "hex_bytes")]
    pub ps: Vec<u8>,
}

// ============================================================================
// Serde helpers
// ============================================================================

mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
