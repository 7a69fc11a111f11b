//! Error types for the codec boundary.

use thiserror::Error;

/// Errors raised while encoding or decoding payloads.
///
/// Decoding never silently truncates: malformed or foreign-format input
/// always fails closed with `Decode`.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be encoded.
    #[error("encode error: {message}")]
    Encode { message: String },

    /// Bytes could not be decoded back into a value.
    #[error("decode error: {message}")]
    Decode { message: String },

    /// Encoded payload exceeds the configured envelope ceiling.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
