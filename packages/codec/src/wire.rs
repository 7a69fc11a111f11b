//! Request, response, and stream frame types shared by client and node.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Tag for one unit of streamed output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    /// Lines written to standard output during the call.
    Stdout,
    /// Lines written to standard error during the call.
    Stderr,
    /// The terminal result-or-exception frame. Always last, exactly once.
    Result,
}

/// One frame of a streamed response.
///
/// `data` is itself a sealed envelope payload: base64 of the encoded lines
/// (for `Stdout`/`Stderr`) or of the [`CallOutcome`] (for `Result`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFrame {
    pub output_type: OutputType,
    pub data: String,
}

/// A remote exception captured as data.
///
/// The node never raises caller-code failures in its own process; it carries
/// them across the boundary in this form, and the client reconstructs a local
/// error from it. The traceback text is verbatim from the remote side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionInfo {
    /// Error kind, e.g. "ValueError" or "panic".
    pub kind: String,
    /// The exception's own message.
    pub message: String,
    /// Remote traceback text, never reconstructed locally.
    pub traceback: String,
}

impl ExceptionInfo {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: traceback.into(),
        }
    }
}

impl std::fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The `(result, exception, traceback)` triple of a non-streaming response
/// and of the terminal `Result` frame.
///
/// The client must check the exception slot before using the value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionInfo>,
}

impl CallOutcome {
    /// A successful outcome carrying a value.
    pub fn ok(value: Value) -> Self {
        Self {
            value: Some(value),
            exception: None,
        }
    }

    /// An empty successful outcome (acknowledgment).
    pub fn ack() -> Self {
        Self::default()
    }

    /// A failed outcome carrying the remote exception.
    pub fn error(exception: ExceptionInfo) -> Self {
        Self {
            value: None,
            exception: Some(exception),
        }
    }

    /// Split into the value or the remote exception.
    pub fn into_result(self) -> Result<Option<Value>, ExceptionInfo> {
        match self.exception {
            Some(e) => Err(e),
            None => Ok(self.value),
        }
    }
}

/// How a run request wants its result delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Wait for the call to settle and return the outcome in the response.
    #[default]
    Call,
    /// Return the run key immediately; retrieve the result via `get_object`.
    Remote,
}

/// Names the function to execute on the node.
///
/// How the node maps a locator onto executable code is its resolver's
/// concern; the locator itself is just an address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Locator {
    /// Module (or path) component of the address.
    pub module: String,
    /// Function name within the module.
    pub function: String,
    /// Delivery mode for the result.
    #[serde(default)]
    pub kind: CallKind,
}

impl Locator {
    /// A locator that waits for the outcome.
    pub fn call(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            kind: CallKind::Call,
        }
    }

    /// A locator that returns its run key immediately.
    pub fn remote(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            kind: CallKind::Remote,
        }
    }

    /// The `module:function` form used in logs and resolver lookups.
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.module, self.function)
    }
}

/// A request to execute a function on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Caller-supplied run key for explicit reuse; the node generates one
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    pub locator: Locator,

    /// Opaque resource requirements, forwarded to the execution side.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Value>,

    /// Named environment the call executes against.
    #[serde(default)]
    pub env: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, Value>,
}

impl RunRequest {
    pub fn new(locator: Locator) -> Self {
        Self {
            key: None,
            locator,
            resources: BTreeMap::new(),
            env: String::new(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.resources.insert(name.into(), value.into());
        self
    }
}

/// Request payload for `get_object`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    #[serde(default)]
    pub stream_logs: bool,
}

/// Request payload for `put_object`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: Value,
    /// Pinned entries survive bulk clears.
    #[serde(default)]
    pub pinned: bool,
}

/// Request payload for `cancel`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Best-effort interruption of in-progress work. Cooperative only.
    #[serde(default)]
    pub force: bool,
    /// Cancel every pending and running invocation atomically.
    #[serde(default)]
    pub all: bool,
}

/// Request payload for `install`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub packages: Vec<String>,
    #[serde(default)]
    pub env: String,
}

/// Request payload for `clear_pins`.
///
/// An empty key list clears every unpinned entry; explicit keys are removed
/// regardless of pin state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClearRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{decode, encode};

    #[test]
    fn outcome_splits_into_result() {
        let ok = CallOutcome::ok(Value::from(6i64));
        assert_eq!(ok.into_result().unwrap(), Some(Value::Integer(6)));

        let err = CallOutcome::error(ExceptionInfo::new("ValueError", "boom", "tb"));
        let e = err.into_result().unwrap_err();
        assert_eq!(e.message, "boom");
        assert_eq!(e.traceback, "tb");
    }

    #[test]
    fn run_request_builder() {
        let req = RunRequest::new(Locator::call("ops", "summer"))
            .with_key("sum-1")
            .with_env("base")
            .with_arg(1i64)
            .with_arg(5i64)
            .with_kwarg("scale", 2i64)
            .with_resource("cpus", 4i64);

        assert_eq!(req.key.as_deref(), Some("sum-1"));
        assert_eq!(req.locator.qualified(), "ops:summer");
        assert_eq!(req.args.len(), 2);
        assert_eq!(req.kwargs["scale"], Value::Integer(2));
        assert_eq!(req.resources["cpus"], Value::Integer(4));
    }

    #[test]
    fn run_request_round_trips() {
        let req = RunRequest::new(Locator::remote("ops", "train")).with_arg("dataset");
        let back: RunRequest = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(back.locator.kind, CallKind::Remote);
        assert_eq!(back.args, vec![Value::from("dataset")]);
        assert!(back.key.is_none());
    }

    #[test]
    fn output_type_tags_are_lowercase() {
        let json = serde_json::to_string(&OutputType::Stdout).unwrap();
        assert_eq!(json, "\"stdout\"");
        let json = serde_json::to_string(&OutputType::Result).unwrap();
        assert_eq!(json, "\"result\"");
    }

    #[test]
    fn exception_info_displays_kind_and_message() {
        let e = ExceptionInfo::new("TypeError", "bad argument", "trace");
        assert_eq!(e.to_string(), "TypeError: bad argument");
    }
}
