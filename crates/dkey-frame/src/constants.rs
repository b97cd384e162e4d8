//! Wire constants for command frames.

// ============================================================================
// Command type tags
// ============================================================================

/// Vehicle control command (lock, unlock, trunk...).
pub const TAG_CONTROL: u8 = 1;
/// Transparent pass-through data.
pub const TAG_TRANSFER: u8 = 2;
/// Authentication handshake message.
pub const TAG_AUTH: u8 = 3;
/// Calibration (demarcation) sub-protocol message.
pub const TAG_CALIBRATION: u8 = 4;
/// Resend of a previously unacknowledged command.
pub const TAG_RETRY: u8 = 5;

// ============================================================================
// Header layout
// ============================================================================

/// Flags bit: a permission mask follows the flags byte.
pub const FLAG_MASK_PRESENT: u8 = 0x01;
/// All flag bits this version understands.
pub const FLAGS_KNOWN: u8 = FLAG_MASK_PRESENT;

/// type(1) + flags(1) + payload_len(2), without the optional mask.
pub const MIN_HEADER_SIZE: usize = 4;

/// Maximum permission mask length (length is carried in one byte).
pub const MAX_MASK_SIZE: usize = u8::MAX as usize;

/// Maximum payload length accepted by the codec.
pub const MAX_PAYLOAD_SIZE: usize = 4096;

// ============================================================================
// Crypto trailer
// ============================================================================

/// Session key size in bytes.
pub const SESSION_KEY_SIZE: usize = 32;
/// ChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 12;
/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;
/// Trailer appended to every encrypted frame: nonce + tag.
pub const TRAILER_SIZE: usize = NONCE_SIZE + TAG_SIZE;
