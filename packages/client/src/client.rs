//! Blocking HTTP client for one Outpost node.
//!
//! Every operation seals its request into an [`Envelope`], POSTs it, and
//! opens the sealed [`CallOutcome`] in the response. A filled exception
//! slot becomes a local [`Error`] carrying the remote traceback verbatim.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use outpost_codec::{
    decode, CallOutcome, CancelRequest, ClearRequest, Envelope, GetRequest, InstallRequest,
    OutputFrame, OutputType, PutRequest, RunRequest, Value,
};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sink::LogSink;

/// A client connected to one Outpost node.
///
/// The interface is synchronous; one request maps to one HTTP exchange.
/// [`shutdown`](OutpostClient::shutdown) releases the transport; requests
/// after that fail locally without touching the network.
pub struct OutpostClient {
    client: Option<Client>,
    base_url: Url,
}

impl OutpostClient {
    /// Connect to the node at `base_url`, e.g. `http://localhost:50052`.
    ///
    /// No overall request timeout is set: `Call` runs and log streams stay
    /// open as long as the remote work does. Use [`with_timeout`] for
    /// operations that must fail fast.
    ///
    /// [`with_timeout`]: OutpostClient::with_timeout
    pub fn new(base_url: &str) -> Result<Self> {
        Self::build(base_url, None)
    }

    /// Connect with a per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: std::time::Duration) -> Result<Self> {
        Self::build(base_url, Some(timeout))
    }

    fn build(base_url: &str, timeout: Option<std::time::Duration>) -> Result<Self> {
        let base_url = Url::parse(base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client: Some(client),
            base_url,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| Error::InvalidUrl {
            message: e.to_string(),
        })
    }

    fn http(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| Error::Protocol {
            message: "transport released by shutdown".to_string(),
        })
    }

    fn open_outcome(response: reqwest::blocking::Response) -> Result<CallOutcome> {
        if !response.status().is_success() {
            return Err(Error::Protocol {
                message: format!("HTTP error: {}", response.status()),
            });
        }
        let envelope: Envelope = response.json()?;
        Ok(envelope.open()?)
    }

    fn post_sealed<T: Serialize>(&self, path: &str, payload: &T) -> Result<CallOutcome> {
        let envelope = Envelope::seal(payload)?;
        let response = self.http()?.post(self.url(path)?).json(&envelope).send()?;
        Self::open_outcome(response)
    }

    fn get_outcome(&self, path: &str) -> Result<CallOutcome> {
        let response = self.http()?.get(self.url(path)?).send()?;
        Self::open_outcome(response)
    }

    fn settle(outcome: CallOutcome) -> Result<Option<Value>> {
        outcome.into_result().map_err(Error::from_exception)
    }

    /// Whether the node answers its health check.
    pub fn is_connected(&self) -> bool {
        matches!(self.get_outcome("check"), Ok(outcome) if outcome.exception.is_none())
    }

    /// Execute a run request. For a `Call` locator this blocks until the
    /// call settles and returns its value; for a `Remote` locator it
    /// returns the run key immediately.
    pub fn run_module(&self, request: &RunRequest) -> Result<Option<Value>> {
        debug!(locator = %request.locator.qualified(), "run_module");
        Self::settle(self.post_sealed("run", request)?)
    }

    /// Store a value on the node under `key`.
    pub fn put_object(&self, key: &str, value: Value, pinned: bool) -> Result<()> {
        let request = PutRequest {
            key: key.to_string(),
            value,
            pinned,
        };
        Self::settle(self.post_sealed("object/put", &request)?)?;
        Ok(())
    }

    /// Fetch the value stored under `key`, blocking until the producing
    /// run settles if one is still in flight.
    pub fn get_object(&self, key: &str) -> Result<Option<Value>> {
        let request = GetRequest {
            key: key.to_string(),
            stream_logs: false,
        };
        Self::settle(self.post_sealed("object/get", &request)?)
    }

    /// Fetch `key` while replaying the producing run's stdout and stderr
    /// into `sink` as they arrive. Output produced before this call is
    /// replayed first, in production order.
    pub fn get_object_streaming(
        &self,
        key: &str,
        sink: &mut dyn LogSink,
    ) -> Result<Option<Value>> {
        let request = GetRequest {
            key: key.to_string(),
            stream_logs: true,
        };
        let envelope = Envelope::seal(&request)?;
        let response = self
            .http()?
            .post(self.url("object/get")?)
            .json(&envelope)
            .send()?;
        if !response.status().is_success() {
            return Err(Error::Protocol {
                message: format!("HTTP error: {}", response.status()),
            });
        }

        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.map_err(|e| Error::Protocol {
                message: format!("stream read failed: {}", e),
            })?;
            if line.is_empty() {
                continue;
            }
            let frame: OutputFrame = serde_json::from_str(&line)?;
            match frame.output_type {
                OutputType::Stdout => sink.stdout(&open_frame::<Vec<String>>(&frame)?),
                OutputType::Stderr => sink.stderr(&open_frame::<Vec<String>>(&frame)?),
                OutputType::Result => {
                    let outcome: CallOutcome = open_frame(&frame)?;
                    return Self::settle(outcome);
                }
            }
        }

        Err(Error::Protocol {
            message: "stream ended without a result frame".to_string(),
        })
    }

    /// Every stored or registered key on the node, sorted. Includes runs
    /// that are still in flight or settled without a stored value.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let value = Self::settle(self.get_outcome("keys")?)?;
        let Some(Value::Array(items)) = value else {
            return Err(Error::Protocol {
                message: "keys response was not an array".to_string(),
            });
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(Error::Protocol {
                    message: format!("non-string key in response: {:?}", other),
                }),
            })
            .collect()
    }

    /// Remove the named keys regardless of pin state, or every unpinned
    /// entry when `keys` is empty.
    pub fn clear_pins(&self, keys: &[String]) -> Result<()> {
        let request = ClearRequest {
            keys: keys.to_vec(),
        };
        Self::settle(self.post_sealed("object/clear", &request)?)?;
        Ok(())
    }

    /// Cancel the named runs. With `force`, in-progress work is
    /// interrupted at its next safe point rather than left to finish.
    pub fn cancel_runs(&self, keys: &[String], force: bool) -> Result<()> {
        let request = CancelRequest {
            keys: keys.to_vec(),
            force,
            all: false,
        };
        Self::settle(self.post_sealed("cancel", &request)?)?;
        Ok(())
    }

    /// Cancel every pending and running invocation on the node.
    pub fn cancel_all(&self, force: bool) -> Result<()> {
        let request = CancelRequest {
            keys: Vec::new(),
            force,
            all: true,
        };
        Self::settle(self.post_sealed("cancel", &request)?)?;
        Ok(())
    }

    /// Install packages into a named environment on the node. Fails with
    /// the node's install traceback when resolution fails.
    pub fn install_packages(&self, packages: &[String], env: &str) -> Result<()> {
        let request = InstallRequest {
            packages: packages.to_vec(),
            env: env.to_string(),
        };
        Self::settle(self.post_sealed("install", &request)?)?;
        Ok(())
    }

    /// Forward provider secrets to the node. The payload is opaque to the
    /// transport.
    pub fn add_secrets(&self, secrets: &BTreeMap<String, Value>) -> Result<()> {
        Self::settle(self.post_sealed("secrets", secrets)?)?;
        Ok(())
    }

    /// Release the local transport. Idempotent; the node is untouched.
    /// Requests made after this fail locally with a protocol error.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            debug!("transport released");
        }
        Ok(())
    }

    /// Ask the node process to stop serving. This tears down the remote
    /// side; the local transport stays usable for other nodes.
    pub fn stop_node(&self) -> Result<()> {
        let response = self.http()?.post(self.url("shutdown")?).send()?;
        Self::settle(Self::open_outcome(response)?)?;
        Ok(())
    }
}

fn open_frame<T: DeserializeOwned>(frame: &OutputFrame) -> Result<T> {
    let bytes = BASE64
        .decode(&frame.data)
        .map_err(|e| Error::Protocol {
            message: format!("invalid frame payload: {}", e),
        })?;
    Ok(decode(&bytes)?)
}
