//! Serialization and deserialization for the `MeshChat` wire protocol.
//!
//! Messages are encoded with postcard. Decoding also validates the result,
//! so a caller never sees a message without a source or with an oversized
//! payload.

use crate::message::{MAX_PAYLOAD_SIZE, Message, ValidationError};

/// Upper bound on an encoded message: payload plus generous header room.
pub const MAX_ENCODED_SIZE: usize = MAX_PAYLOAD_SIZE + 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Input is larger than any valid encoded message.
    #[error("encoded message too large: {size} bytes (max {max} bytes)")]
    Oversized {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
    /// The message decoded but is not a valid protocol message.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),
}

/// Encodes a [`Message`] into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(message).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes and validates a [`Message`] from a byte slice.
///
/// # Errors
///
/// Returns `CodecError::Oversized` if the input cannot be a valid message,
/// `CodecError::Serialization` if the bytes cannot be deserialized, or
/// `CodecError::Invalid` if the decoded message fails validation.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(CodecError::Oversized {
            size: bytes.len(),
            max: MAX_ENCODED_SIZE,
        });
    }
    let message: Message =
        postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))?;
    message.validate()?;
    Ok(message)
}
