//! # outpost-node
//!
//! The remote-resident side of Outpost: a key-addressed object store, an
//! execution engine dispatching onto registered functions, a job registry
//! tracking every invocation from submission to terminal state, and the
//! HTTP server that exposes them.
//!
//! A node is assembled from a [`FunctionRegistry`] naming the callable
//! surface and an [`EnvManager`] owning package installs, then served:
//!
//! ```no_run
//! use std::sync::Arc;
//! use outpost_codec::Value;
//! use outpost_node::{serve, AcceptAll, EnvManager, FunctionRegistry, NodeState, DEFAULT_PORT};
//!
//! # async fn start() -> outpost_node::Result<()> {
//! let functions = Arc::new(FunctionRegistry::new());
//! functions.register("ops", "summer", |ctx| {
//!     let total: i64 = ctx.args.iter().filter_map(|v| v.as_i64()).sum();
//!     Ok(Value::from(total))
//! });
//! let envs = Arc::new(EnvManager::new(Arc::new(AcceptAll)));
//! let state = Arc::new(NodeState::new(functions, envs));
//! serve(state, ([0, 0, 0, 0], DEFAULT_PORT).into()).await
//! # }
//! ```

pub mod engine;
pub mod envs;
pub mod error;
pub mod registry;
pub mod server;
pub mod store;

pub use engine::{CallContext, CallError, CallResult, ExecutionEngine, FunctionRegistry, RemoteFn};
pub use envs::{AcceptAll, EnvGuard, EnvManager, EnvState, PackageInstaller};
pub use error::{NodeError, Result};
pub use registry::{EventLog, Invocation, JobRegistry, OutputEvent, RunStatus};
pub use server::{router, serve, serve_listener, NodeState, DEFAULT_PORT};
pub use store::{ObjectStore, StoredObject};
