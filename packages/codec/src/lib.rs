//! # outpost-codec
//!
//! Wire codec and shared envelope types for the Outpost remote-execution
//! protocol.
//!
//! Every request and response is one [`Envelope`]: base64 of a
//! self-describing encoded payload. Payloads are either protocol structs
//! ([`RunRequest`], [`CallOutcome`], ...) or dynamic [`Value`] trees for
//! arguments and results. `Envelope::open` is the exact inverse of
//! `Envelope::seal`, and decoding fails closed on truncated or
//! foreign-format input.
//!
//! ```
//! use outpost_codec::{Envelope, Value};
//!
//! let env = Envelope::seal(&Value::from(42i64)).unwrap();
//! let back: Value = env.open().unwrap();
//! assert_eq!(back, Value::Integer(42));
//! ```

pub mod envelope;
pub mod error;
pub mod value;
pub mod wire;

pub use envelope::{decode, encode, Envelope, DEFAULT_MAX_PAYLOAD};
pub use error::CodecError;
pub use value::Value;
pub use wire::{
    CallKind, CallOutcome, CancelRequest, ClearRequest, ExceptionInfo, GetRequest, InstallRequest,
    Locator, OutputFrame, OutputType, PutRequest, RunRequest,
};
