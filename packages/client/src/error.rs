use outpost_codec::{CodecError, ExceptionInfo};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid URL: {message}")]
    InvalidUrl { message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Key not found on node: {0}")]
    NotFound(String),

    #[error("Remote exception: {0}")]
    Remote(ExceptionInfo),

    #[error("Protocol error: {message}")]
    Protocol { message: String },
}

impl Error {
    /// Map a wire exception onto the client taxonomy.
    ///
    /// The node reports absence with the `NotFoundError` kind; everything
    /// else stays a remote exception carrying the node's traceback.
    pub(crate) fn from_exception(exception: ExceptionInfo) -> Self {
        if exception.kind == "NotFoundError" {
            Error::NotFound(exception.message)
        } else {
            Error::Remote(exception)
        }
    }

    /// The remote traceback, when this error crossed the wire with one.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Error::Remote(e) if !e.traceback.is_empty() => Some(&e.traceback),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
