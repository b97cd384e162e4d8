//! Local device identity.

use sha2::{Digest, Sha256};

const FINGERPRINT_DOMAIN: &[u8] = b"dkey-device-fingerprint";

/// Stable identifier of this device.
///
/// Derived once from a platform-provided seed; sent in the handshake and
/// used as the mobile id in backend calls.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceFingerprint([u8; 32]);

impl DeviceFingerprint {
    /// Derive the fingerprint from a device seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(seed);
        DeviceFingerprint(hasher.finalize().into())
    }

    /// Wrap raw fingerprint bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        DeviceFingerprint(bytes)
    }

    /// Get the fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceFingerprint({}…)", &self.to_hex()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = DeviceFingerprint::from_seed(b"phone-serial-1");
        let b = DeviceFingerprint::from_seed(b"phone-serial-1");
        let c = DeviceFingerprint::from_seed(b"phone-serial-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), 64);
    }
}
