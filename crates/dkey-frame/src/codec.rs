//! Frame encoding and decoding.
//!
//! ## Frame Format
//!
//! | Field       | Size (bytes)        | Description                                           |
//! |-------------|---------------------|-------------------------------------------------------|
//! | type        | 1                   | Command type tag (`TAG_*`).                           |
//! | flags       | 1                   | Bit 0: permission mask present. Other bits reserved.  |
//! | mask_len    | 1 (optional)        | Mask length, only if bit 0 of flags is set.           |
//! | mask        | mask_len (optional) | Permission mask bytes.                                |
//! | payload_len | 2                   | Payload length, little-endian.                        |
//! | payload     | payload_len         | Plaintext for `Auth`, ciphertext for everything else. |
//! | trailer     | 28 (optional)       | nonce(12) + tag(16), on every type except `Auth`.     |
//!
//! Everything before the payload is the frame header and is authenticated as
//! associated data on encrypted frames.

use crate::constants::*;
use crate::crypto::{open_payload, seal_payload};
use crate::{CommandFrame, CommandType, DecodeError, EncodeError, PermissionMask, SessionKey};

// ============================================================================
// Encoding Functions
// ============================================================================

/// Encode a frame to bytes.
///
/// Every type except [`CommandType::Auth`] is encrypted under `key`; encoding
/// such a frame without a key is an error.
pub fn encode_frame(frame: &CommandFrame, key: Option<&SessionKey>) -> Result<Vec<u8>, EncodeError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(EncodeError::PayloadTooLarge {
            size: frame.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let header = encode_header(frame);

    if !frame.command_type.is_encrypted() {
        let mut buf = header;
        buf.extend_from_slice(&frame.payload);
        return Ok(buf);
    }

    let key = key.ok_or(EncodeError::MissingSessionKey(frame.command_type.as_str()))?;
    let sealed = seal_payload(&frame.payload, &header, key)?;

    let mut buf = Vec::with_capacity(header.len() + sealed.ciphertext.len() + TRAILER_SIZE);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&sealed.ciphertext);
    buf.extend_from_slice(&sealed.trailer());
    Ok(buf)
}

/// Encode the frame header.
/// Format: type(1) + flags(1) + [mask_len(1) + mask] + payload_len(2)
fn encode_header(frame: &CommandFrame) -> Vec<u8> {
    let mask_size = frame.permission_mask.as_ref().map_or(0, |m| 1 + m.len());
    let mut buf = Vec::with_capacity(MIN_HEADER_SIZE + mask_size + frame.payload.len());

    buf.push(frame.command_type.tag());

    match &frame.permission_mask {
        Some(mask) => {
            buf.push(FLAG_MASK_PRESENT);
            buf.push(mask.len() as u8);
            buf.extend_from_slice(mask.as_bytes());
        }
        None => buf.push(0),
    }

    buf.extend_from_slice(&(frame.payload.len() as u16).to_le_bytes());
    buf
}

// ============================================================================
// Decoding Functions
// ============================================================================

/// Determine the command type from the leading tag without decoding the rest.
pub fn peek_command_type(data: &[u8]) -> Result<CommandType, DecodeError> {
    let tag = *data.first().ok_or_else(|| DecodeError::too_short(1, 0))?;
    CommandType::from_tag(tag)
}

/// Parsed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command type.
    pub command_type: CommandType,
    /// Permission mask, if present.
    pub permission_mask: Option<PermissionMask>,
    /// Payload length.
    pub payload_len: usize,
    /// Header length in bytes (offset of the payload).
    pub header_len: usize,
}

impl FrameHeader {
    /// Total encoded frame length including any trailer.
    pub fn frame_len(&self) -> usize {
        let trailer = if self.command_type.is_encrypted() {
            TRAILER_SIZE
        } else {
            0
        };
        self.header_len + self.payload_len + trailer
    }
}

/// Decode just the frame header.
pub fn decode_header(data: &[u8]) -> Result<FrameHeader, DecodeError> {
    let command_type = peek_command_type(data)?;
    let mut offset = 1;

    // Flags (1 byte)
    if data.len() < offset + 1 {
        return Err(DecodeError::too_short(offset + 1, data.len()));
    }
    let flags = data[offset];
    offset += 1;

    if flags & !FLAGS_KNOWN != 0 {
        return Err(DecodeError::IntegrityFailure(format!(
            "reserved flag bits set: 0x{:02X}",
            flags
        )));
    }

    // Permission mask (optional)
    let permission_mask = if flags & FLAG_MASK_PRESENT != 0 {
        if data.len() < offset + 1 {
            return Err(DecodeError::too_short(offset + 1, data.len()));
        }
        let mask_len = data[offset] as usize;
        offset += 1;

        if data.len() < offset + mask_len {
            return Err(DecodeError::too_short(offset + mask_len, data.len()));
        }
        let mask = PermissionMask::new(data[offset..offset + mask_len].to_vec())
            .map_err(|e| DecodeError::IntegrityFailure(e.to_string()))?;
        offset += mask_len;
        Some(mask)
    } else {
        None
    };

    // Payload length (2 bytes)
    if data.len() < offset + 2 {
        return Err(DecodeError::too_short(offset + 2, data.len()));
    }
    let payload_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
    offset += 2;

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(DecodeError::IntegrityFailure(format!(
            "payload length {} exceeds maximum {}",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    Ok(FrameHeader {
        command_type,
        permission_mask,
        payload_len,
        header_len: offset,
    })
}

/// Decode a frame from bytes.
///
/// `key` must be the session key active at the sender when the frame was
/// encoded; it is ignored for `Auth` frames.
pub fn decode_frame(data: &[u8], key: Option<&SessionKey>) -> Result<CommandFrame, DecodeError> {
    let header = decode_header(data)?;
    let frame_len = header.frame_len();

    if data.len() < frame_len {
        return Err(DecodeError::too_short(frame_len, data.len()));
    }
    if data.len() > frame_len {
        return Err(DecodeError::IntegrityFailure(format!(
            "{} trailing bytes after frame",
            data.len() - frame_len
        )));
    }

    let payload_start = header.header_len;
    let payload_end = payload_start + header.payload_len;
    let body = &data[payload_start..payload_end];

    let payload = if header.command_type.is_encrypted() {
        let key = key.ok_or_else(|| {
            DecodeError::DecryptFailure(format!(
                "no session key for {} frame",
                header.command_type
            ))
        })?;

        let mut trailer = [0u8; TRAILER_SIZE];
        trailer.copy_from_slice(&data[payload_end..frame_len]);

        open_payload(body, &data[..payload_start], key, &trailer).ok_or_else(|| {
            DecodeError::IntegrityFailure("authentication tag mismatch".to_string())
        })?
    } else {
        body.to_vec()
    };

    Ok(CommandFrame {
        command_type: header.command_type,
        permission_mask: header.permission_mask,
        payload,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_random_key;

    #[test]
    fn test_auth_frame_is_plaintext() {
        let frame = CommandFrame::auth(vec![0x01, 0x02, 0x03]);
        let encoded = encode_frame(&frame, None).unwrap();

        assert_eq!(encoded, vec![TAG_AUTH, 0x00, 0x03, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(decode_frame(&encoded, None).unwrap(), frame);
    }

    #[test]
    fn test_control_frame_roundtrip() {
        let key = generate_random_key();
        let mask = PermissionMask::parse_hex("0x01").unwrap();
        let frame = CommandFrame::control(mask, vec![0x10]);

        let encoded = encode_frame(&frame, Some(&key)).unwrap();
        // type + flags + mask_len + mask + len(2) + payload + trailer
        assert_eq!(encoded.len(), 1 + 1 + 1 + 1 + 2 + 1 + TRAILER_SIZE);
        assert_eq!(&encoded[..4], &[TAG_CONTROL, FLAG_MASK_PRESENT, 0x01, 0x01]);

        let decoded = decode_frame(&encoded, Some(&key)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_every_type_roundtrips() {
        let key = generate_random_key();
        for ty in CommandType::ALL {
            let frame = CommandFrame::new(ty, None, vec![0xAA; 40]);
            let encoded = encode_frame(&frame, Some(&key)).unwrap();
            assert_eq!(decode_frame(&encoded, Some(&key)).unwrap(), frame, "type {}", ty);
        }
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let key = generate_random_key();
        let frame = CommandFrame::transfer(Vec::new());
        let encoded = encode_frame(&frame, Some(&key)).unwrap();
        assert_eq!(decode_frame(&encoded, Some(&key)).unwrap(), frame);
    }

    #[test]
    fn test_encode_without_key_fails() {
        let frame = CommandFrame::transfer(vec![1]);
        assert_eq!(
            encode_frame(&frame, None),
            Err(EncodeError::MissingSessionKey("transfer"))
        );
    }

    #[test]
    fn test_encode_payload_too_large() {
        let frame = CommandFrame::auth(vec![0; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            encode_frame(&frame, None),
            Err(EncodeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_peek_command_type() {
        assert_eq!(peek_command_type(&[TAG_CALIBRATION, 0xFF]), Ok(CommandType::Calibration));
        assert_eq!(peek_command_type(&[]), Err(DecodeError::too_short(1, 0)));
        assert_eq!(peek_command_type(&[0x00]), Err(DecodeError::UnknownType(0x00)));
    }

    #[test]
    fn test_decode_truncated_frames() {
        let key = generate_random_key();
        let frame = CommandFrame::control(PermissionMask::parse_hex("0x0102").unwrap(), vec![9; 8]);
        let encoded = encode_frame(&frame, Some(&key)).unwrap();

        for cut in 0..encoded.len() {
            let result = decode_frame(&encoded[..cut], Some(&key));
            assert!(
                matches!(result, Err(DecodeError::TooShort { .. })),
                "cut at {} gave {:?}",
                cut,
                result
            );
        }
    }

    #[test]
    fn test_decode_tampered_payload() {
        let key = generate_random_key();
        let frame = CommandFrame::transfer(vec![1, 2, 3, 4]);
        let mut encoded = encode_frame(&frame, Some(&key)).unwrap();
        encoded[MIN_HEADER_SIZE] ^= 0x01;

        assert!(matches!(
            decode_frame(&encoded, Some(&key)),
            Err(DecodeError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_decode_tampered_mask() {
        let key = generate_random_key();
        let frame = CommandFrame::control(PermissionMask::parse_hex("0x01").unwrap(), vec![0x10]);
        let mut encoded = encode_frame(&frame, Some(&key)).unwrap();
        encoded[3] = 0xFF;

        assert!(matches!(
            decode_frame(&encoded, Some(&key)),
            Err(DecodeError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_decode_without_key() {
        let key = generate_random_key();
        let encoded = encode_frame(&CommandFrame::transfer(vec![1]), Some(&key)).unwrap();

        assert!(matches!(
            decode_frame(&encoded, None),
            Err(DecodeError::DecryptFailure(_))
        ));
    }

    #[test]
    fn test_decode_wrong_key() {
        let encoded =
            encode_frame(&CommandFrame::transfer(vec![1]), Some(&generate_random_key())).unwrap();
        assert!(matches!(
            decode_frame(&encoded, Some(&generate_random_key())),
            Err(DecodeError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_decode_reserved_flags() {
        let data = [TAG_AUTH, 0x80, 0x00, 0x00];
        assert!(matches!(
            decode_frame(&data, None),
            Err(DecodeError::IntegrityFailure(_))
        ));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut encoded = encode_frame(&CommandFrame::auth(vec![7]), None).unwrap();
        encoded.push(0x00);
        assert!(matches!(
            decode_frame(&encoded, None),
            Err(DecodeError::IntegrityFailure(_))
        ));
    }
}
