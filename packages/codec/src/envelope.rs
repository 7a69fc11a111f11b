//! Encoding functions and the request/response envelope.
//!
//! Every request and response unit on the wire is one `Envelope`: a base64
//! string of the self-describing encoded payload. `Envelope::open` is the
//! exact inverse of `Envelope::seal`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Default ceiling for a single encoded payload: 1 GiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024 * 1024;

/// Encode a value into self-describing bytes.
///
/// Never fails for plain data; values containing non-serializable handles
/// surface as `CodecError::Encode`.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CodecError::Encode {
        message: e.to_string(),
    })
}

/// Decode bytes produced by [`encode`].
///
/// Truncated or foreign-format input fails with `CodecError::Decode`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
        message: e.to_string(),
    })
}

/// The byte container for one request or response unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// base64 of the encoded payload.
    pub data: String,
}

impl Envelope {
    /// Seal a payload with the default size ceiling.
    pub fn seal<T: Serialize>(value: &T) -> Result<Self> {
        Self::seal_with_limit(value, DEFAULT_MAX_PAYLOAD)
    }

    /// Seal a payload, failing with `PayloadTooLarge` before transmission
    /// if the encoded form exceeds `limit` bytes.
    pub fn seal_with_limit<T: Serialize>(value: &T, limit: usize) -> Result<Self> {
        let bytes = encode(value)?;
        if bytes.len() > limit {
            return Err(CodecError::PayloadTooLarge {
                size: bytes.len(),
                limit,
            });
        }
        Ok(Self {
            data: BASE64.encode(bytes),
        })
    }

    /// Open the envelope back into its payload.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = BASE64.decode(&self.data).map_err(|e| CodecError::Decode {
            message: format!("invalid base64: {}", e),
        })?;
        decode(&bytes)
    }
}
