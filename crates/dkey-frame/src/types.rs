//! Common types used in command frames.

use crate::constants::*;
use crate::error::{DecodeError, MaskError};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Command type carried in the leading byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Vehicle control command.
    Control,
    /// Transparent pass-through data.
    Transfer,
    /// Authentication handshake.
    Auth,
    /// Calibration sub-protocol.
    Calibration,
    /// Resend of an unacknowledged command.
    Retry,
}

impl CommandType {
    /// Every command type, in tag order.
    pub const ALL: [CommandType; 5] = [
        CommandType::Control,
        CommandType::Transfer,
        CommandType::Auth,
        CommandType::Calibration,
        CommandType::Retry,
    ];

    /// Wire tag for this type.
    pub const fn tag(self) -> u8 {
        match self {
            CommandType::Control => TAG_CONTROL,
            CommandType::Transfer => TAG_TRANSFER,
            CommandType::Auth => TAG_AUTH,
            CommandType::Calibration => TAG_CALIBRATION,
            CommandType::Retry => TAG_RETRY,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            TAG_CONTROL => Ok(CommandType::Control),
            TAG_TRANSFER => Ok(CommandType::Transfer),
            TAG_AUTH => Ok(CommandType::Auth),
            TAG_CALIBRATION => Ok(CommandType::Calibration),
            TAG_RETRY => Ok(CommandType::Retry),
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    /// Whether the payload travels encrypted under the session key.
    ///
    /// Only handshake messages go in the clear; they establish the key.
    pub const fn is_encrypted(self) -> bool {
        !matches!(self, CommandType::Auth)
    }

    /// Whether sending this type requires an authenticated session.
    ///
    /// `Auth` establishes the session and `Calibration` is gated by its own
    /// session object, so both bypass the dispatcher's check.
    pub const fn requires_authentication(self) -> bool {
        !matches!(self, CommandType::Auth | CommandType::Calibration)
    }

    /// Lowercase name, used in logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            CommandType::Control => "control",
            CommandType::Transfer => "transfer",
            CommandType::Auth => "auth",
            CommandType::Calibration => "calibration",
            CommandType::Retry => "retry",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque capability bitstring attached to a control command.
///
/// The vehicle interprets the bits; this side only carries them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionMask(Vec<u8>);

impl PermissionMask {
    /// Create a mask from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Result<Self, MaskError> {
        if bytes.len() > MAX_MASK_SIZE {
            return Err(MaskError::TooLong(bytes.len()));
        }
        Ok(PermissionMask(bytes))
    }

    /// Parse a hex mask such as `"0x01"` or `"00ff"`.
    ///
    /// Odd-length input is left-padded with a zero nibble.
    pub fn parse_hex(s: &str) -> Result<Self, MaskError> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let padded = if digits.len() % 2 == 1 {
            format!("0{}", digits)
        } else {
            digits.to_string()
        };
        let bytes = hex::decode(&padded).map_err(|_| MaskError::InvalidHex(s.to_string()))?;
        Self::new(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the mask as a lowercase hex string (no prefix).
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Number of bytes in the mask.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the mask has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every bit set in `self` is also set in `granted`.
    ///
    /// Masks of different lengths are compared right-aligned, so `0x01`
    /// and `0x0001` are the same capability.
    pub fn is_subset_of(&self, granted: &PermissionMask) -> bool {
        let a = &self.0;
        let b = &granted.0;
        let width = a.len().max(b.len());
        (0..width).all(|i| {
            let x = if i < width - a.len() { 0 } else { a[i - (width - a.len())] };
            let y = if i < width - b.len() { 0 } else { b[i - (width - b.len())] };
            x & !y == 0
        })
    }
}

impl AsRef<[u8]> for PermissionMask {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The unit of post-connection wire exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Command type.
    pub command_type: CommandType,
    /// Optional permission mask.
    pub permission_mask: Option<PermissionMask>,
    /// Plaintext payload.
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Create a new frame.
    pub fn new(
        command_type: CommandType,
        permission_mask: Option<PermissionMask>,
        payload: Vec<u8>,
    ) -> Self {
        CommandFrame {
            command_type,
            permission_mask,
            payload,
        }
    }

    /// Create a control frame with a permission mask.
    pub fn control(mask: PermissionMask, payload: Vec<u8>) -> Self {
        Self::new(CommandType::Control, Some(mask), payload)
    }

    /// Create a pass-through frame.
    pub fn transfer(payload: Vec<u8>) -> Self {
        Self::new(CommandType::Transfer, None, payload)
    }

    /// Create a handshake frame.
    pub fn auth(payload: Vec<u8>) -> Self {
        Self::new(CommandType::Auth, None, payload)
    }

    /// Create a calibration frame.
    pub fn calibration(payload: Vec<u8>) -> Self {
        Self::new(CommandType::Calibration, None, payload)
    }

    /// Wrap `original` as a `Retry` frame.
    ///
    /// The payload becomes `[original type tag][original payload]` and the
    /// mask is carried over, so the vehicle can re-execute the same logical
    /// command.
    pub fn retry_of(original: &CommandFrame) -> Self {
        let mut payload = Vec::with_capacity(1 + original.payload.len());
        payload.push(original.command_type.tag());
        payload.extend_from_slice(&original.payload);
        Self::new(CommandType::Retry, original.permission_mask.clone(), payload)
    }

    /// For a `Retry` frame, recover the original command.
    pub fn unwrap_retry(&self) -> Option<CommandFrame> {
        if self.command_type != CommandType::Retry {
            return None;
        }
        let (&tag, rest) = self.payload.split_first()?;
        let inner = CommandType::from_tag(tag).ok()?;
        if inner == CommandType::Retry {
            return None;
        }
        Some(CommandFrame::new(
            inner,
            self.permission_mask.clone(),
            rest.to_vec(),
        ))
    }
}

/// Symmetric key protecting post-handshake frames.
///
/// Zeroized on drop; `Debug` never prints the key bytes.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Create a session key from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        SessionKey(bytes)
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// Short non-secret identifier for logs.
    ///
    /// First 4 bytes of the Poly1305 tag of an empty message under a zero
    /// nonce.
    pub fn fingerprint(&self) -> String {
        use chacha20poly1305::aead::{Aead, NewAead};
        use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        match cipher.encrypt(Nonce::from_slice(&[0u8; NONCE_SIZE]), b"".as_ref()) {
            Ok(tag) => hex::encode(&tag[..4]),
            Err(_) => String::from("????????"),
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}
