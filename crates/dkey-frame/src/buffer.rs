//! Reassembly of frames split across BLE notifications.
//!
//! A notification carries at most one ATT MTU of data, so a single frame may
//! arrive in several chunks and one chunk may complete one frame and start
//! the next. [`FrameBuffer`] accumulates chunks and yields whole encoded
//! frames, ready for [`decode_frame`](crate::decode_frame).

use crate::codec::decode_header;
use crate::DecodeError;
use bytes::BytesMut;

/// Initial buffer capacity.
const INITIAL_CAPACITY: usize = 512;

/// Accumulates incoming bytes and splits them into encoded frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// Buffer for accumulating incoming data.
    buffer: BytesMut,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        FrameBuffer {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to take the next complete encoded frame out of the buffer.
    ///
    /// Returns `None` when more data is needed. A header that can never
    /// become valid (unknown tag, reserved flags, oversized length) drops the
    /// buffered bytes and is reported once as an error.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, DecodeError>> {
        if self.buffer.is_empty() {
            return None;
        }

        let header = match decode_header(&self.buffer) {
            Ok(header) => header,
            Err(DecodeError::TooShort { .. }) => return None,
            Err(e) => {
                self.buffer.clear();
                return Some(Err(e));
            }
        };

        let frame_len = header.frame_len();
        if self.buffer.len() < frame_len {
            return None;
        }

        Some(Ok(self.buffer.split_to(frame_len).to_vec()))
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_frame, encode_frame, generate_random_key, CommandFrame};

    #[test]
    fn test_chunked_frame() {
        let key = generate_random_key();
        let frame = CommandFrame::transfer(vec![0x55; 60]);
        let encoded = encode_frame(&frame, Some(&key)).unwrap();

        let mut buffer = FrameBuffer::new();
        let mut chunks = encoded.chunks(20);

        buffer.push(chunks.next().unwrap());
        assert!(buffer.next_frame().is_none());

        for chunk in chunks {
            buffer.push(chunk);
        }
        let bytes = buffer.next_frame().unwrap().unwrap();
        assert_eq!(decode_frame(&bytes, Some(&key)).unwrap(), frame);
        assert_eq!(buffer.buffered_len(), 0);
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let a = encode_frame(&CommandFrame::auth(vec![1, 2]), None).unwrap();
        let b = encode_frame(&CommandFrame::auth(vec![3]), None).unwrap();

        let mut buffer = FrameBuffer::new();
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        buffer.push(&joined);

        assert_eq!(buffer.next_frame(), Some(Ok(a)));
        assert_eq!(buffer.next_frame(), Some(Ok(b)));
        assert_eq!(buffer.next_frame(), None);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0xEE, 0x00, 0x00]);

        assert_eq!(buffer.next_frame(), Some(Err(DecodeError::UnknownType(0xEE))));
        assert_eq!(buffer.buffered_len(), 0);
        assert_eq!(buffer.next_frame(), None);
    }
}
