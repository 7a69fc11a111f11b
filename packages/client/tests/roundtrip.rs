//! End-to-end tests against a real in-process node.

use std::collections::BTreeMap;
use std::sync::Arc;

use outpost_client::{CollectSink, Error, OutpostClient};
use outpost_codec::{Locator, RunRequest, Value};
use outpost_node::{
    serve_listener, AcceptAll, CallContext, CallError, CallResult, EnvManager, FunctionRegistry,
    NodeState, PackageInstaller,
};

fn test_functions() -> Arc<FunctionRegistry> {
    let functions = Arc::new(FunctionRegistry::new());
    functions.register("ops", "summer", |ctx: &CallContext| {
        let total: i64 = ctx.args.iter().filter_map(|v| v.as_i64()).sum();
        Ok(Value::from(total))
    });
    functions.register("ops", "boom", |_ctx: &CallContext| -> CallResult {
        Err(CallError::new("ValueError", "boom"))
    });
    functions.register("ops", "chatty", |ctx: &CallContext| {
        ctx.emit_stdout(vec!["step 1".to_string()]);
        ctx.emit_stderr(vec!["warn".to_string()]);
        ctx.emit_stdout(vec!["step 2".to_string()]);
        Ok(Value::from("done"))
    });
    functions.register("ops", "slow", |ctx: &CallContext| {
        for _ in 0..400 {
            ctx.check_cancelled()?;
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        Ok(Value::from("finished"))
    });
    functions
}

async fn start_node(installer: Arc<dyn PackageInstaller>) -> (Arc<NodeState>, String) {
    let envs = Arc::new(EnvManager::new(installer));
    let state = Arc::new(NodeState::new(test_functions(), envs));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        serve_listener(server_state, listener).await.unwrap();
    });
    (state, url)
}

async fn with_client<F, R>(url: String, f: F) -> R
where
    F: FnOnce(OutpostClient) -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(OutpostClient::new(&url).unwrap()))
        .await
        .unwrap()
}

#[tokio::test]
async fn run_module_round_trips_a_sum() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    let value = with_client(url, |client| {
        assert!(client.is_connected());
        let req = RunRequest::new(Locator::call("ops", "summer"))
            .with_arg(1i64)
            .with_arg(5i64);
        client.run_module(&req)
    })
    .await
    .unwrap();
    assert_eq!(value, Some(Value::Integer(6)));
}

#[tokio::test]
async fn remote_failure_carries_traceback_as_data() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    let err = with_client(url, |client| {
        client.run_module(&RunRequest::new(Locator::call("ops", "boom")))
    })
    .await
    .unwrap_err();

    match err {
        Error::Remote(e) => {
            assert_eq!(e.kind, "ValueError");
            assert_eq!(e.message, "boom");
            assert!(!e.traceback.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn remote_run_streams_output_in_order() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    let (value, stdout, stderr) = with_client(url, |client| {
        let req = RunRequest::new(Locator::remote("ops", "chatty")).with_key("chat");
        let key = client.run_module(&req).unwrap();
        assert_eq!(key, Some(Value::from("chat")));

        let mut sink = CollectSink::new();
        let value = client.get_object_streaming("chat", &mut sink).unwrap();
        (value, sink.stdout, sink.stderr)
    })
    .await;

    assert_eq!(value, Some(Value::from("done")));
    assert_eq!(stdout, vec!["step 1".to_string(), "step 2".to_string()]);
    assert_eq!(stderr, vec!["warn".to_string()]);
}

#[tokio::test]
async fn cancelled_run_settles_as_cancelled() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    let err = with_client(url, |client| {
        let req = RunRequest::new(Locator::remote("ops", "slow")).with_key("slow-run");
        client.run_module(&req).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(50));
        client
            .cancel_runs(&["slow-run".to_string()], true)
            .unwrap();

        client.get_object("slow-run")
    })
    .await
    .unwrap_err();

    match err {
        Error::Remote(e) => assert_eq!(e.kind, "Cancelled"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn pinned_objects_survive_bulk_clear() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    with_client(url, |client| {
        client
            .put_object("model", Value::from("weights"), true)
            .unwrap();
        client
            .put_object("scratch", Value::from(1i64), false)
            .unwrap();

        client.clear_pins(&[]).unwrap();

        assert_eq!(client.list_keys().unwrap(), vec!["model".to_string()]);
        assert_eq!(
            client.get_object("model").unwrap(),
            Some(Value::from("weights"))
        );
        assert!(matches!(
            client.get_object("scratch").unwrap_err(),
            Error::NotFound(_)
        ));

        // Named clears remove pinned entries too.
        client.clear_pins(&["model".to_string()]).unwrap();
        assert!(client.list_keys().unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn broken_env_rejects_runs_until_repaired() {
    struct RejectNamed(&'static str);
    impl PackageInstaller for RejectNamed {
        fn install(&self, package: &str, _env: &str) -> Result<(), String> {
            if package == self.0 {
                Err(format!("cannot resolve {}", package))
            } else {
                Ok(())
            }
        }
    }

    let (_state, url) = start_node(Arc::new(RejectNamed("badpkg"))).await;
    with_client(url, |client| {
        let err = client
            .install_packages(&["badpkg".to_string()], "base")
            .unwrap_err();
        assert!(matches!(err, Error::Remote(ref e) if e.kind == "InstallError"));

        let err = client
            .run_module(
                &RunRequest::new(Locator::call("ops", "summer"))
                    .with_env("base")
                    .with_arg(1i64),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Remote(ref e) if e.kind == "InstallError"));

        // A successful install repairs the env.
        client
            .install_packages(&["goodpkg".to_string()], "base")
            .unwrap();
        let value = client
            .run_module(
                &RunRequest::new(Locator::call("ops", "summer"))
                    .with_env("base")
                    .with_arg(1i64),
            )
            .unwrap();
        assert_eq!(value, Some(Value::Integer(1)));
    })
    .await;
}

#[tokio::test]
async fn secrets_are_forwarded_verbatim() {
    let (state, url) = start_node(Arc::new(AcceptAll)).await;
    with_client(url, |client| {
        let mut secrets = BTreeMap::new();
        secrets.insert("aws".to_string(), Value::from("creds"));
        client.add_secrets(&secrets).unwrap();
    })
    .await;
    assert_eq!(state.secret_providers(), vec!["aws".to_string()]);
}

#[tokio::test]
async fn shutdown_releases_only_the_local_transport() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    let check_url = url.clone();
    with_client(url, |mut client| {
        client.shutdown().unwrap();
        client.shutdown().unwrap();

        assert!(!client.is_connected());
        assert!(matches!(
            client.get_object("k").unwrap_err(),
            Error::Protocol { .. }
        ));
    })
    .await;

    // The node is untouched; a fresh client still reaches it.
    let connected = with_client(check_url, |client| client.is_connected()).await;
    assert!(connected);
}

#[tokio::test]
async fn stop_node_stops_serving() {
    let (_state, url) = start_node(Arc::new(AcceptAll)).await;
    let check_url = url.clone();
    with_client(url, |client| {
        client.stop_node().unwrap();
    })
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let connected = with_client(check_url, |client| client.is_connected()).await;
    assert!(!connected);
}
