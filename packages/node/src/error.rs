//! Error types for the node side.

use outpost_codec::{CodecError, ExceptionInfo};
use thiserror::Error;

/// Errors that can occur while serving node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The key was never registered on this node.
    #[error("key not found: {0}")]
    NotFound(String),

    /// An environment mutation failed. Carries the failing package and the
    /// installer's traceback text.
    #[error("install failed for package '{package}' in env '{env}'")]
    Install {
        package: String,
        env: String,
        traceback: String,
    },

    /// No handler is registered for the locator.
    #[error("no function registered for locator: {0}")]
    UnknownFunction(String),

    /// Codec failure on a request or acknowledgment path.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

impl NodeError {
    /// Convert into the error-as-data form carried over the wire.
    ///
    /// Kind strings are stable protocol identifiers the client maps back
    /// onto its own error taxonomy.
    pub fn to_exception(&self) -> ExceptionInfo {
        match self {
            NodeError::NotFound(key) => {
                ExceptionInfo::new("NotFoundError", format!("key not found: {}", key), "")
            }
            NodeError::Install {
                package,
                env,
                traceback,
            } => ExceptionInfo::new(
                "InstallError",
                format!("install failed for package '{}' in env '{}'", package, env),
                traceback.clone(),
            ),
            NodeError::UnknownFunction(locator) => ExceptionInfo::new(
                "NotFoundError",
                format!("no function registered for locator: {}", locator),
                "",
            ),
            NodeError::Codec(CodecError::Encode { message }) => {
                ExceptionInfo::new("EncodingError", message.clone(), "")
            }
            NodeError::Codec(CodecError::Decode { message }) => {
                ExceptionInfo::new("DecodingError", message.clone(), "")
            }
            NodeError::Codec(CodecError::PayloadTooLarge { size, limit }) => {
                ExceptionInfo::new(
                    "PayloadTooLargeError",
                    format!("payload of {} bytes exceeds the {} byte limit", size, limit),
                    "",
                )
            }
            NodeError::Io(e) => ExceptionInfo::new("IoError", e.to_string(), ""),
        }
    }
}
