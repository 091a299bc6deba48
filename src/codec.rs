//! Binary codec for canonical command serialization.
//!
//! This module provides a centralized interface for encoding and decoding
//! kernel types using bincode. It encapsulates the bincode configuration so
//! serialization stays deterministic across the codebase:
//!
//! - **Fixed-size integers**: variable-length encodings would make the
//!   canonical byte stream depend on value magnitude, which is hostile to
//!   the frame-hash fold.
//! - **Centralized configuration**: one `config()` definition instead of
//!   repeated `bincode::config::standard().with_fixed_int_encoding()` calls.
//!
//! The frame-hash fold in [`crate::kernel`] runs every queued command
//! through [`encode`]; hosts may also use this codec to ship
//! [`NetCommand`](crate::NetCommand) values through their transport.
//!
//! # Examples
//!
//! ```
//! use bastion_lockstep::codec::{decode, encode};
//!
//! let value: u32 = 42;
//! let bytes = encode(&value).expect("encoding should succeed");
//! let (decoded, _read): (u32, _) = decode(&bytes).expect("decoding should succeed");
//! assert_eq!(value, decoded);
//! ```

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

// Fixed-int encoding keeps the byte stream deterministic and
// platform-independent, which the frame-hash fold depends on.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Errors that can occur during encoding or decoding.
#[derive(Debug)]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError(String),
    /// The decoding operation failed.
    DecodeError(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError(msg) => write!(f, "encoding failed: {msg}"),
            Self::DecodeError(msg) => write!(f, "decoding failed: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::EncodeError(e.to_string()))
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::DecodeError(e.to_string()))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}
