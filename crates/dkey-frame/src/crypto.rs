//! Frame payload encryption and decryption.
//!
//! Encrypted frames use ChaCha20-Poly1305 with a random 12-byte nonce per
//! frame and a detached 16-byte tag. The frame header is bound to the
//! ciphertext as associated data, so the type tag and permission mask cannot
//! be altered in transit.

use crate::constants::*;
use crate::{EncodeError, SessionKey};
use chacha20poly1305::{
    aead::{AeadInPlace, NewAead},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::Rng;

/// Encrypted payload with its trailer parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// Random nonce used for this frame.
    pub nonce: [u8; NONCE_SIZE],
    /// Poly1305 tag.
    pub tag: [u8; TAG_SIZE],
}

impl SealedPayload {
    /// Trailer bytes: nonce followed by tag.
    pub fn trailer(&self) -> [u8; TRAILER_SIZE] {
        let mut trailer = [0u8; TRAILER_SIZE];
        trailer[..NONCE_SIZE].copy_from_slice(&self.nonce);
        trailer[NONCE_SIZE..].copy_from_slice(&self.tag);
        trailer
    }
}

/// Encrypt a payload with a random nonce.
pub fn seal_payload(
    plaintext: &[u8],
    associated_data: &[u8],
    key: &SessionKey,
) -> Result<SealedPayload, EncodeError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill(&mut nonce);
    seal_payload_with_nonce(plaintext, associated_data, key, nonce)
}

/// Encrypt a payload with a provided nonce.
pub fn seal_payload_with_nonce(
    plaintext: &[u8],
    associated_data: &[u8],
    key: &SessionKey,
    nonce: [u8; NONCE_SIZE],
) -> Result<SealedPayload, EncodeError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), associated_data, &mut ciphertext)
        .map_err(|e| EncodeError::Encryption(format!("seal failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedPayload {
        ciphertext,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypt and verify a payload.
///
/// Returns `None` when the tag does not verify (wrong key, tampered header,
/// tampered ciphertext).
pub fn open_payload(
    ciphertext: &[u8],
    associated_data: &[u8],
    key: &SessionKey,
    trailer: &[u8; TRAILER_SIZE],
) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from_slice(&trailer[..NONCE_SIZE]);
    let tag = Tag::from_slice(&trailer[NONCE_SIZE..]);

    let mut plaintext = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(nonce, associated_data, &mut plaintext, tag)
        .ok()?;
    Some(plaintext)
}

/// Generate a random session key.
///
/// Session keys normally come out of the handshake; this is for tests and
/// offline tooling.
pub fn generate_random_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_SIZE];
    rand::thread_rng().fill(&mut key);
    SessionKey::from_bytes(key)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = generate_random_key();
        let sealed = seal_payload(b"unlock", b"hdr", &key).unwrap();

        assert_eq!(sealed.ciphertext.len(), 6);
        assert_ne!(sealed.ciphertext, b"unlock");

        let opened = open_payload(&sealed.ciphertext, b"hdr", &key, &sealed.trailer()).unwrap();
        assert_eq!(opened, b"unlock");
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_random_key();
        let key2 = generate_random_key();

        let sealed = seal_payload(b"secret", b"", &key1).unwrap();
        assert!(open_payload(&sealed.ciphertext, b"", &key2, &sealed.trailer()).is_none());
    }

    #[test]
    fn test_associated_data_is_bound() {
        let key = generate_random_key();
        let sealed = seal_payload(b"payload", b"header-a", &key).unwrap();
        assert!(open_payload(&sealed.ciphertext, b"header-b", &key, &sealed.trailer()).is_none());
    }

    #[test]
    fn test_fixed_nonce_is_deterministic() {
        let key = SessionKey::from_bytes([7u8; SESSION_KEY_SIZE]);
        let a = seal_payload_with_nonce(b"x", b"", &key, [1u8; NONCE_SIZE]).unwrap();
        let b = seal_payload_with_nonce(b"x", b"", &key, [1u8; NONCE_SIZE]).unwrap();
        assert_eq!(a, b);
    }
}
