//! Integration tests against a live listener
//!
//! These tests serve a real configuration on an ephemeral port and drive it
//! with reqwest. Pipelines reach thin HTTP servers through `rest` nodes so
//! dependency ordering and failures can be observed from the outside.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use flowapi::config::ServerConfig;
use flowapi::pipeline::{BuiltinFactory, PipelineFactory};
use flowapi::server::{
    serve, AppState, DrainReport, Lifecycle, LifecycleState, Registry, ServeOptions,
    ServerContext, ServerError,
};

/// Counters for the thin backend
#[derive(Debug, Clone, Default)]
struct BackendState {
    auth_calls: Arc<AtomicUsize>,
    lookup_calls: Arc<AtomicUsize>,
}

/// Accepts only `{"token": "secret", ...}`
async fn auth_handler(
    State(state): State<BackendState>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.auth_calls.fetch_add(1, Ordering::SeqCst);
    if payload.get("token") == Some(&json!("secret")) {
        (StatusCode::OK, Json(json!({"ok": true})))
    } else {
        (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "internal auth detail"})),
        )
    }
}

async fn lookup_handler(
    State(state): State<BackendState>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    state.lookup_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "found": payload }))
}

/// Start the thin backend and return its base URL
async fn start_backend() -> (String, BackendState) {
    let state = BackendState::default();
    let app = Router::new()
        .route("/auth", post(auth_handler))
        .route("/lookup", post(lookup_handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind backend");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    sleep(Duration::from_millis(50)).await;
    (format!("http://{}", addr), state)
}

const CONFIG: &str = r#"
engine:
  ext: [rest]
dependencies:
  - name: auth
    min_size: 1
    max_size: 2
    pipeline:
      node:
        - {name: check, type: rest, method: POST, url: "BACKEND/auth", body: "$PARAM", timeout: 5}
api:
  - version: "1"
    route: /users/{id}
    depends: [auth]
    min_size: 1
    max_size: 2
    pipeline:
      node:
        - {name: lookup, type: rest, method: POST, url: "BACKEND/lookup", body: "$PARAM", timeout: 5}
        - {name: reply, type: response, headers: {x-served-by: "$WORKER"}}
      digraph: ["lookup -> reply"]
  - version: "1"
    route: /constant
    methods: [GET]
    min_size: 0
    max_size: 1
    pipeline:
      node:
        - {name: c, type: constant, value: {hello: world}}
  - version: "1"
    route: /broken
    methods: [GET]
    min_size: 0
    max_size: 1
    pipeline:
      node:
        - {name: down, type: rest, url: "http://127.0.0.1:1/unreachable", timeout: 2}
"#;

struct Running {
    base: String,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<Registry>,
    ctx: Arc<ServerContext>,
    task: JoinHandle<Result<DrainReport, ServerError>>,
}

/// Serve `CONFIG` on an ephemeral port
async fn start_flowapi(backend: &str) -> Running {
    let config = ServerConfig::from_str(&CONFIG.replace("BACKEND", backend)).unwrap();
    let factory = Arc::new(BuiltinFactory::new());
    for ext in &config.engine.ext {
        factory.load_extension(ext).unwrap();
    }
    let registry = Arc::new(Registry::build(&config, factory).unwrap());
    let lifecycle = Arc::new(Lifecycle::new());
    let ctx = Arc::new(ServerContext::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let task = tokio::spawn(serve(
        listener,
        AppState::new(Arc::clone(&registry), Arc::clone(&lifecycle)),
        ServeOptions {
            tls: None,
            drain_timeout: Duration::from_secs(5),
        },
        Arc::clone(&ctx),
    ));

    for _ in 0..50 {
        if lifecycle.state() == LifecycleState::Serving {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    Running {
        base: format!("http://{}", addr),
        lifecycle,
        registry,
        ctx,
        task,
    }
}

#[tokio::test]
async fn test_get_runs_dependency_then_main() {
    let (backend, counters) = start_backend().await;
    let server = start_flowapi(&backend).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/v1/users/7?token=secret&id=ignored", server.base))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let served_by = response.headers()["x-served-by"].to_str().unwrap().to_string();
    assert!(served_by.starts_with("/v1/users/{id}["));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"found": {"id": "7", "token": "secret"}}));

    assert_eq!(counters.auth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(counters.lookup_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_post_merges_body_with_path() {
    let (backend, _counters) = start_backend().await;
    let server = start_flowapi(&backend).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/users/9", server.base))
        .json(&json!({"token": "secret", "id": "body", "tags": ["a", "b"]}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"found": {"id": "9", "token": "secret", "tags": ["a", "b"]}})
    );
}

#[tokio::test]
async fn test_failed_dependency_short_circuits() {
    let (backend, counters) = start_backend().await;
    let server = start_flowapi(&backend).await;

    let response = reqwest::get(format!("{}/v1/users/7?token=wrong", server.base))
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let text = response.text().await.unwrap();
    assert!(text.contains("Requested process failed"));
    assert!(!text.contains("internal auth detail"));

    assert_eq!(counters.auth_calls.load(Ordering::SeqCst), 1);
    assert_eq!(counters.lookup_calls.load(Ordering::SeqCst), 0);

    // The failed dependency worker went back to its pool
    let status = server.registry.status();
    assert_eq!(status.dependencies[0].checked_out, 0);
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let (backend, counters) = start_backend().await;
    let server = start_flowapi(&backend).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/users/1", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(counters.auth_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_method_and_version_routing() {
    let (backend, _counters) = start_backend().await;
    let server = start_flowapi(&backend).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/v1/constant", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"hello": "world"})
    );

    let response = client
        .post(format!("{}/v1/constant", server.base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    let response = client
        .get(format!("{}/v2/constant", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_node_failure_does_not_leak() {
    let (backend, _counters) = start_backend().await;
    let server = start_flowapi(&backend).await;

    let response = reqwest::get(format!("{}/v1/broken", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"detail": "Requested process failed"}));
}

#[tokio::test]
async fn test_health_and_status() {
    let (backend, _counters) = start_backend().await;
    let server = start_flowapi(&backend).await;

    let response = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(response.status(), 200);

    let status: Value = reqwest::get(format!("{}/status", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "SERVING");
    assert_eq!(status["pools"]["routes"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_drain_is_ordered_and_single_shot() {
    let (backend, _counters) = start_backend().await;
    let server = start_flowapi(&backend).await;

    let status = reqwest::get(format!("{}/v1/constant", server.base))
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);

    server.ctx.spawn("idle", std::future::pending::<()>());

    assert!(server.lifecycle.request_drain("test"));
    assert!(!server.lifecycle.request_drain("again"));

    let report = tokio::time::timeout(Duration::from_secs(10), server.task)
        .await
        .expect("drain finished")
        .unwrap()
        .unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(server.lifecycle.state(), LifecycleState::Stopped);
    assert!(server.registry.endpoints().iter().all(|e| !e.is_registered()));
    let status = server.registry.status();
    assert!(status.routes.iter().all(|p| p.closed));
    assert!(status.dependencies.iter().all(|p| p.closed));

    // The listener is gone
    let result = reqwest::Client::new()
        .get(format!("{}/health", server.base))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    assert!(result.is_err());
}
