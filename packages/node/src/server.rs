//! The HTTP surface of the node.
//!
//! Every endpoint speaks sealed envelopes: requests arrive as JSON bodies
//! holding one base64 `data` field, responses carry a sealed [`CallOutcome`].
//! `get_object` with `stream_logs` responds with newline-delimited
//! [`OutputFrame`] JSON, terminated by exactly one `result` frame.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use outpost_codec::{
    encode, CallKind, CallOutcome, CancelRequest, ClearRequest, Envelope, GetRequest,
    InstallRequest, OutputFrame, OutputType, PutRequest, RunRequest, Value,
};
use tokio::sync::Notify;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::engine::{ExecutionEngine, FunctionRegistry};
use crate::envs::EnvManager;
use crate::error::{NodeError, Result};
use crate::registry::{JobRegistry, OutputEvent};
use crate::store::ObjectStore;

/// Port the node listens on when none is configured.
pub const DEFAULT_PORT: u16 = 50052;

/// Shared state behind every handler.
pub struct NodeState {
    pub store: Arc<ObjectStore>,
    pub jobs: Arc<JobRegistry>,
    pub envs: Arc<EnvManager>,
    pub functions: Arc<FunctionRegistry>,
    engine: ExecutionEngine,
    secrets: Mutex<BTreeMap<String, Value>>,
    shutdown: Notify,
}

impl NodeState {
    pub fn new(functions: Arc<FunctionRegistry>, envs: Arc<EnvManager>) -> Self {
        let store = Arc::new(ObjectStore::new());
        let jobs = Arc::new(JobRegistry::new());
        let engine = ExecutionEngine::new(
            Arc::clone(&functions),
            Arc::clone(&jobs),
            Arc::clone(&store),
            Arc::clone(&envs),
        );
        Self {
            store,
            jobs,
            envs,
            functions,
            engine,
            secrets: Mutex::new(BTreeMap::new()),
            shutdown: Notify::new(),
        }
    }

    /// Providers whose secrets have been forwarded to this node.
    pub fn secret_providers(&self) -> Vec<String> {
        self.secrets.lock().unwrap().keys().cloned().collect()
    }

    /// Ask the server loop to stop accepting connections.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

/// Build the node router over shared state.
pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/check", get(check))
        .route("/run", post(run))
        .route("/object/get", post(get_object))
        .route("/object/put", post(put_object))
        .route("/object/clear", post(clear))
        .route("/keys", get(keys))
        .route("/cancel", post(cancel))
        .route("/install", post(install))
        .route("/secrets", post(secrets))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Serve the node on `addr` until `request_shutdown` is called.
pub async fn serve(state: Arc<NodeState>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(state, listener).await
}

/// Serve the node on an already-bound listener.
pub async fn serve_listener(state: Arc<NodeState>, listener: tokio::net::TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "node listening");
    }
    let signal_state = Arc::clone(&state);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { signal_state.shutdown.notified().await })
        .await?;
    info!("node stopped");
    Ok(())
}

/// Seal an outcome into the response envelope. A seal failure degrades to
/// a plain 500 so the connection still gets an answer.
fn outcome_response(outcome: CallOutcome) -> Response {
    match Envelope::seal(&outcome) {
        Ok(envelope) => Json(envelope).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to seal response");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failure").into_response()
        }
    }
}

fn error_response(error: NodeError) -> Response {
    outcome_response(CallOutcome::error(error.to_exception()))
}

/// Open a sealed request body, or produce the decode-failure response.
fn open_request<T: serde::de::DeserializeOwned>(
    envelope: &Envelope,
) -> std::result::Result<T, Response> {
    envelope
        .open()
        .map_err(|e| error_response(NodeError::Codec(e)))
}

async fn check(State(_state): State<Arc<NodeState>>) -> Response {
    let mut info = BTreeMap::new();
    info.insert("status".to_string(), Value::from("ok"));
    info.insert("version".to_string(), Value::from(env!("CARGO_PKG_VERSION")));
    outcome_response(CallOutcome::ok(Value::Map(info)))
}

async fn run(State(state): State<Arc<NodeState>>, Json(envelope): Json<Envelope>) -> Response {
    let request: RunRequest = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let kind = request.locator.kind;

    let invocation = match state.engine.submit(request).await {
        Ok(inv) => inv,
        Err(e) => return error_response(e),
    };

    match kind {
        // Fire and forget: hand back the run key for later retrieval.
        CallKind::Remote => {
            outcome_response(CallOutcome::ok(Value::from(invocation.key().to_string())))
        }
        CallKind::Call => outcome_response(invocation.wait_outcome().await),
    }
}

async fn get_object(
    State(state): State<Arc<NodeState>>,
    Json(envelope): Json<Envelope>,
) -> Response {
    let request: GetRequest = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    if request.stream_logs {
        return stream_object(state, request.key);
    }

    // Prefer the settled invocation so failures come back as data; fall
    // through to direct store entries for plain puts.
    if let Some(invocation) = state.jobs.get(&request.key) {
        return outcome_response(invocation.wait_outcome().await);
    }
    match state.store.get(&request.key) {
        Some(value) => outcome_response(CallOutcome::ok(value)),
        None => error_response(NodeError::NotFound(request.key)),
    }
}

fn frame_line(output_type: OutputType, payload: &[u8]) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let frame = OutputFrame {
        output_type,
        data: STANDARD.encode(payload),
    };
    let mut line = serde_json::to_vec(&frame).ok()?;
    line.push(b'\n');
    Some(line)
}

fn stream_object(state: Arc<NodeState>, key: String) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<
        std::result::Result<axum::body::Bytes, std::convert::Infallible>,
    >(64);

    tokio::spawn(async move {
        let send_frame = |output_type: OutputType, payload: Vec<u8>| {
            frame_line(output_type, &payload).map(axum::body::Bytes::from)
        };

        let terminal = match state.jobs.get(&key) {
            Some(invocation) => {
                // Replay the log from the start, then follow it live until
                // the terminal result frame.
                let mut index = 0;
                loop {
                    let event = invocation.log().wait_from(index).await;
                    index += 1;
                    let (output_type, payload) = match event {
                        OutputEvent::Stdout(lines) => (OutputType::Stdout, encode(&lines)),
                        OutputEvent::Stderr(lines) => (OutputType::Stderr, encode(&lines)),
                        OutputEvent::Result(outcome) => {
                            break (OutputType::Result, encode(&outcome))
                        }
                    };
                    let Ok(payload) = payload else { return };
                    let Some(bytes) = send_frame(output_type, payload) else {
                        return;
                    };
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
            }
            None => {
                let outcome = match state.store.get(&key) {
                    Some(value) => CallOutcome::ok(value),
                    None => CallOutcome::error(NodeError::NotFound(key.clone()).to_exception()),
                };
                (OutputType::Result, encode(&outcome))
            }
        };

        let (output_type, payload) = terminal;
        let Ok(payload) = payload else { return };
        if let Some(bytes) = send_frame(output_type, payload) {
            let _ = tx.send(Ok(bytes)).await;
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn put_object(
    State(state): State<Arc<NodeState>>,
    Json(envelope): Json<Envelope>,
) -> Response {
    let request: PutRequest = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.pinned {
        state.store.put_pinned(request.key, request.value);
    } else {
        state.store.put(request.key, request.value);
    }
    outcome_response(CallOutcome::ack())
}

async fn clear(State(state): State<Arc<NodeState>>, Json(envelope): Json<Envelope>) -> Response {
    let request: ClearRequest = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.keys.is_empty() {
        state.store.clear_unpinned();
        let keep = state.store.list_keys();
        state.jobs.sweep_terminal(&keep);
    } else {
        state.store.clear(&request.keys);
        state.jobs.remove_terminal(&request.keys);
    }
    outcome_response(CallOutcome::ack())
}

async fn keys(State(state): State<Arc<NodeState>>) -> Response {
    // Stored objects plus registered runs: an in-flight run, or one that
    // failed and never produced a stored value, is still listed.
    let mut keys = state.store.list_keys();
    keys.extend(state.jobs.list_keys());
    keys.sort();
    keys.dedup();
    let values = keys.into_iter().map(Value::from).collect::<Vec<_>>();
    outcome_response(CallOutcome::ok(Value::Array(values)))
}

async fn cancel(State(state): State<Arc<NodeState>>, Json(envelope): Json<Envelope>) -> Response {
    let request: CancelRequest = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if request.all {
        state.jobs.cancel_all(request.force);
    } else {
        state.jobs.cancel(&request.keys, request.force);
    }
    outcome_response(CallOutcome::ack())
}

async fn install(State(state): State<Arc<NodeState>>, Json(envelope): Json<Envelope>) -> Response {
    let request: InstallRequest = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.envs.install(&request.packages, &request.env).await {
        Ok(()) => outcome_response(CallOutcome::ack()),
        Err(e) => error_response(e),
    }
}

async fn secrets(State(state): State<Arc<NodeState>>, Json(envelope): Json<Envelope>) -> Response {
    // Secrets arrive as an opaque provider map and are held verbatim.
    let payload: BTreeMap<String, Value> = match open_request(&envelope) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    state.secrets.lock().unwrap().extend(payload);
    outcome_response(CallOutcome::ack())
}

async fn shutdown(State(state): State<Arc<NodeState>>) -> Response {
    info!("shutdown requested");
    state.request_shutdown();
    outcome_response(CallOutcome::ack())
}
