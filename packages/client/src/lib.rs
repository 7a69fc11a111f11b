//! # outpost-client
//!
//! Blocking HTTP client for Outpost nodes.
//!
//! ```ignore
//! use outpost_client::OutpostClient;
//! use outpost_codec::{Locator, RunRequest};
//!
//! let client = OutpostClient::new("http://localhost:50052")?;
//! let req = RunRequest::new(Locator::call("ops", "summer"))
//!     .with_arg(1i64)
//!     .with_arg(5i64);
//! let total = client.run_module(&req)?;
//! ```

pub mod client;
pub mod error;
pub mod sink;

pub use client::OutpostClient;
pub use error::{Error, Result};
pub use sink::{CollectSink, ConsoleSink, LogSink};
