//! Digital key command frames.
//!
//! This crate provides the wire format used between a phone acting as a
//! vehicle digital key and the vehicle's BLE peripheral once a link is up.
//! Every message is a [`CommandFrame`]: a type tag, an optional permission
//! mask, and a payload. All frame types except [`CommandType::Auth`] carry
//! their payload encrypted under the negotiated [`SessionKey`].
//!
//! # Example
//!
//! ```rust,ignore
//! use dkey_frame::{CommandFrame, CommandType, PermissionMask, encode_frame, decode_frame};
//!
//! let frame = CommandFrame::control(PermissionMask::parse_hex("0x01")?, vec![0x10]);
//! let bytes = encode_frame(&frame, Some(&key))?;
//! let decoded = decode_frame(&bytes, Some(&key))?;
//! assert_eq!(decoded, frame);
//! ```

mod buffer;
mod codec;
mod constants;
mod crypto;
mod error;
mod types;

pub use buffer::*;
pub use codec::*;
pub use constants::*;
pub use crypto::*;
pub use error::*;
pub use types::*;
