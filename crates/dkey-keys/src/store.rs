//! Installed digital keys and the current-key selection.

use crate::{DigitalKeyInfo, KeyError};
use dkey_frame::PermissionMask;
use std::collections::BTreeMap;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of an Ed25519 seed or public key.
pub const KEY_BYTES: usize = 32;

/// Secret material delivered with a downloaded key.
///
/// `signing_seed` is the device's Ed25519 seed for this key;
/// `vehicle_public_key` pins the vehicle identity the handshake must prove.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    signing_seed: [u8; KEY_BYTES],
    vehicle_public_key: [u8; KEY_BYTES],
}

impl KeyMaterial {
    /// Create key material from raw bytes.
    pub fn new(signing_seed: [u8; KEY_BYTES], vehicle_public_key: [u8; KEY_BYTES]) -> Self {
        KeyMaterial {
            signing_seed,
            vehicle_public_key,
        }
    }

    /// Create key material from hex strings.
    pub fn from_hex(signing_seed: &str, vehicle_public_key: &str) -> Result<Self, KeyError> {
        Ok(KeyMaterial::new(
            parse_key_hex("signing seed", signing_seed)?,
            parse_key_hex("vehicle public key", vehicle_public_key)?,
        ))
    }

    /// Device signing seed.
    pub fn signing_seed(&self) -> &[u8; KEY_BYTES] {
        &self.signing_seed
    }

    /// Pinned vehicle public key.
    pub fn vehicle_public_key(&self) -> &[u8; KEY_BYTES] {
        &self.vehicle_public_key
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("signing_seed", &"<redacted>")
            .field("vehicle_public_key", &hex::encode(self.vehicle_public_key))
            .finish()
    }
}

fn parse_key_hex(what: &str, s: &str) -> Result<[u8; KEY_BYTES], KeyError> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| KeyError::InvalidKeyMaterial(format!("{}: {}", what, e)))?;
    if bytes.len() != KEY_BYTES {
        return Err(KeyError::InvalidKeyMaterial(format!(
            "{} must be {} bytes, got {}",
            what,
            KEY_BYTES,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_BYTES];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// A key record together with its secret material.
#[derive(Debug, Clone)]
pub struct InstalledKey {
    /// Backend record.
    pub info: DigitalKeyInfo,
    /// Secret material.
    pub material: KeyMaterial,
}

impl InstalledKey {
    /// Create an installed key.
    pub fn new(info: DigitalKeyInfo, material: KeyMaterial) -> Self {
        InstalledKey { info, material }
    }

    /// Key id.
    pub fn id(&self) -> &str {
        &self.info.dk_id
    }

    /// Whether `mask` is covered by one of the key's near-field permissions.
    pub fn permits(&self, mask: &PermissionMask) -> bool {
        self.info
            .near_masks()
            .iter()
            .any(|granted| mask.is_subset_of(granted))
    }
}

/// Locally installed keys, keyed by id, with one optionally selected.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: BTreeMap<String, InstalledKey>,
    current: Option<String>,
}

impl KeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) a key.
    pub fn install(&mut self, key: InstalledKey) {
        debug!(dk_id = %key.id(), vin = %key.info.vin, "installing digital key");
        self.keys.insert(key.id().to_string(), key);
    }

    /// Remove a key. Clears the selection if it was current.
    pub fn remove(&mut self, dk_id: &str) -> Option<InstalledKey> {
        if self.current.as_deref() == Some(dk_id) {
            self.current = None;
        }
        self.keys.remove(dk_id)
    }

    /// Select the key used for the next session.
    ///
    /// Returns `false` if no key with this id is installed; the selection is
    /// left unchanged in that case.
    pub fn set_current(&mut self, dk_id: &str) -> bool {
        if !self.keys.contains_key(dk_id) {
            debug!(dk_id, "cannot select unknown digital key");
            return false;
        }
        self.current = Some(dk_id.to_string());
        true
    }

    /// Currently selected key id.
    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Currently selected key.
    pub fn current(&self) -> Option<&InstalledKey> {
        self.current.as_ref().and_then(|id| self.keys.get(id))
    }

    /// Look up a key by id.
    pub fn get(&self, dk_id: &str) -> Result<&InstalledKey, KeyError> {
        self.keys
            .get(dk_id)
            .ok_or_else(|| KeyError::UnknownKey(dk_id.to_string()))
    }

    /// All installed keys, ordered by id.
    pub fn keys(&self) -> impl Iterator<Item = &InstalledKey> {
        self.keys.values()
    }

    /// Number of installed keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if no keys are installed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop every key and the selection.
    pub fn clear(&mut self) {
        self.keys.clear();
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Permission, PermissionScope};

    fn key(id: &str, mask: &str) -> InstalledKey {
        let info = DigitalKeyInfo {
            dk_id: id.to_string(),
            vin: "VIN".to_string(),
            permission_list: vec![Permission {
                permission_mask: mask.to_string(),
                permission_description: String::new(),
                permission_type: PermissionScope::Near,
                is_choice: true,
            }],
            ..Default::default()
        };
        InstalledKey::new(info, KeyMaterial::new([1; 32], [2; 32]))
    }

    #[test]
    fn test_set_current_requires_installed_key() {
        let mut store = KeyStore::new();
        assert!(!store.set_current("a"));

        store.install(key("a", "0x01"));
        assert!(store.set_current("a"));
        assert_eq!(store.current_id(), Some("a"));

        assert!(!store.set_current("b"));
        assert_eq!(store.current_id(), Some("a"));
    }

    #[test]
    fn test_remove_current_clears_selection() {
        let mut store = KeyStore::new();
        store.install(key("a", "0x01"));
        store.set_current("a");

        assert!(store.remove("a").is_some());
        assert!(store.current().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_permits() {
        let k = key("a", "0x03");
        assert!(k.permits(&PermissionMask::parse_hex("0x01").unwrap()));
        assert!(k.permits(&PermissionMask::parse_hex("0x02").unwrap()));
        assert!(!k.permits(&PermissionMask::parse_hex("0x04").unwrap()));
    }

    #[test]
    fn test_key_material_from_hex() {
        let seed = "11".repeat(32);
        let vehicle = "22".repeat(32);
        let material = KeyMaterial::from_hex(&seed, &vehicle).unwrap();
        assert_eq!(material.signing_seed(), &[0x11; 32]);

        assert!(KeyMaterial::from_hex("1122", &vehicle).is_err());
        assert!(KeyMaterial::from_hex(&seed, "zz").is_err());
    }

    #[test]
    fn test_key_material_debug_is_redacted() {
        let material = KeyMaterial::new([0xAA; 32], [0xBB; 32]);
        let shown = format!("{:?}", material);
        assert!(!shown.contains("aaaa"));
        assert!(shown.contains("bbbb"));
    }
}
