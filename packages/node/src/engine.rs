//! The execution engine: dispatches run requests onto registered functions.
//!
//! Caller-code failures never escape as process errors. Every failure mode,
//! including panics inside a handler, is captured as a [`CallOutcome`] with
//! the exception slot filled and the invocation settled Failed.

use std::backtrace::Backtrace;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use outpost_codec::{CallOutcome, ExceptionInfo, Locator, RunRequest, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::envs::{EnvGuard, EnvManager};
use crate::error::Result;
use crate::registry::{Invocation, JobRegistry, RunStatus};
use crate::store::ObjectStore;

/// An error raised by handler code, captured as data.
///
/// The traceback is captured at construction on the executing side, so it
/// describes where the failure happened, not where it was observed.
#[derive(Debug, Clone)]
pub struct CallError {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl CallError {
    /// A new error with a traceback captured here.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Backtrace::force_capture().to_string(),
        }
    }

    /// The error a handler returns when it observes its cancel token.
    pub fn cancelled() -> Self {
        Self::new("Cancelled", "run was cancelled")
    }

    fn into_exception(self) -> ExceptionInfo {
        ExceptionInfo::new(self.kind, self.message, self.traceback)
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

/// Result type handler functions return.
pub type CallResult = std::result::Result<Value, CallError>;

/// Per-call view handed to a handler: arguments, output emission, and the
/// cancel token.
pub struct CallContext {
    invocation: Arc<Invocation>,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub resources: BTreeMap<String, Value>,
}

impl CallContext {
    /// Positional argument at `index`, if supplied.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Named argument, if supplied.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Emit lines on the call's stdout stream, in production order.
    pub fn emit_stdout(&self, lines: Vec<String>) {
        self.invocation.emit_stdout(lines);
    }

    /// Emit lines on the call's stderr stream.
    pub fn emit_stderr(&self, lines: Vec<String>) {
        self.invocation.emit_stderr(lines);
    }

    /// Whether cancellation was requested. Handlers poll this at safe
    /// points.
    pub fn cancel_requested(&self) -> bool {
        self.invocation.cancel_requested()
    }

    /// Bail out with a cancellation error if the token is set.
    pub fn check_cancelled(&self) -> std::result::Result<(), CallError> {
        if self.cancel_requested() {
            Err(CallError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// A function callable over the wire.
pub type RemoteFn = Arc<dyn Fn(&CallContext) -> CallResult + Send + Sync>;

/// Maps locators onto registered handler functions.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, RemoteFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `module:function`.
    pub fn register<F>(&self, module: &str, function: &str, f: F)
    where
        F: Fn(&CallContext) -> CallResult + Send + Sync + 'static,
    {
        let qualified = format!("{}:{}", module, function);
        self.functions
            .write()
            .unwrap()
            .insert(qualified, Arc::new(f));
    }

    /// Look up the handler for a locator.
    pub fn resolve(&self, locator: &Locator) -> Option<RemoteFn> {
        self.functions
            .read()
            .unwrap()
            .get(&locator.qualified())
            .cloned()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Dispatches run requests: resolves the handler, tracks the invocation,
/// executes off the async runtime, and stores the result.
pub struct ExecutionEngine {
    functions: Arc<FunctionRegistry>,
    jobs: Arc<JobRegistry>,
    store: Arc<ObjectStore>,
    envs: Arc<EnvManager>,
}

impl ExecutionEngine {
    pub fn new(
        functions: Arc<FunctionRegistry>,
        jobs: Arc<JobRegistry>,
        store: Arc<ObjectStore>,
        envs: Arc<EnvManager>,
    ) -> Self {
        Self {
            functions,
            jobs,
            store,
            envs,
        }
    }

    /// Submit a run request. Returns the registered invocation; callers
    /// decide whether to wait for it to settle.
    ///
    /// Resolution failures and broken envs settle the invocation Failed
    /// with the error as data rather than surfacing a transport error.
    pub async fn submit(&self, request: RunRequest) -> Result<Arc<Invocation>> {
        let key = request
            .key
            .clone()
            .unwrap_or_else(|| format!("{}-{}", request.locator.function, Uuid::new_v4()));
        let invocation = self.jobs.register(key.clone(), request.locator.clone());
        info!(key = %key, locator = %request.locator.qualified(), "run submitted");

        let env_guard = match self.envs.begin_run(&request.env).await {
            Ok(guard) => guard,
            Err(e) => {
                invocation.settle(RunStatus::Failed, CallOutcome::error(e.to_exception()));
                return Ok(invocation);
            }
        };

        let handler = match self.functions.resolve(&request.locator) {
            Some(handler) => handler,
            None => {
                let e = crate::error::NodeError::UnknownFunction(request.locator.qualified());
                invocation.settle(RunStatus::Failed, CallOutcome::error(e.to_exception()));
                return Ok(invocation);
            }
        };

        let store = Arc::clone(&self.store);
        let inv = Arc::clone(&invocation);
        tokio::spawn(async move {
            execute(inv, handler, request, store, env_guard).await;
        });

        Ok(invocation)
    }

    /// The job registry backing this engine.
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }
}

async fn execute(
    invocation: Arc<Invocation>,
    handler: RemoteFn,
    request: RunRequest,
    store: Arc<ObjectStore>,
    env_guard: EnvGuard,
) {
    // Held until the run settles so installs cannot mutate the env
    // underneath an executing handler.
    let _env_guard = env_guard;

    // Cancelled before pickup: already settled, nothing to run.
    if !invocation.begin() {
        debug!(key = %invocation.key(), "invocation settled before pickup");
        return;
    }

    let ctx = CallContext {
        invocation: Arc::clone(&invocation),
        args: request.args,
        kwargs: request.kwargs,
        resources: request.resources,
    };

    let key = invocation.key().to_string();
    let joined = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| handler(&ctx)))
    })
    .await;

    match joined {
        Ok(Ok(Ok(value))) => {
            // Store only if this completion won the settle race; a cancel
            // that landed first discards the result.
            if invocation.settle(RunStatus::Completed, CallOutcome::ok(value.clone())) {
                store.put(&key, value);
                debug!(key = %key, "run completed");
            }
        }
        Ok(Ok(Err(call_error))) => {
            let status = if call_error.kind == "Cancelled" {
                RunStatus::Cancelled
            } else {
                RunStatus::Failed
            };
            invocation.settle(status, CallOutcome::error(call_error.into_exception()));
        }
        Ok(Err(payload)) => {
            let message = panic_message(payload);
            error!(key = %key, message = %message, "handler panicked");
            invocation.settle(
                RunStatus::Failed,
                CallOutcome::error(ExceptionInfo::new(
                    "panic",
                    message,
                    Backtrace::force_capture().to_string(),
                )),
            );
        }
        Err(join_error) => {
            invocation.settle(
                RunStatus::Failed,
                CallOutcome::error(ExceptionInfo::new("panic", join_error.to_string(), "")),
            );
        }
    }
}
