use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::server::lifecycle::LifecycleState;
use crate::server::registry::RegistryStatus;
use crate::server::state::AppState;

/// Health check endpoint: 200 while serving, 503 otherwise
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let lifecycle = state.lifecycle.state();
    let code = if lifecycle == LifecycleState::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "state": lifecycle })))
}

/// Lifecycle state and a snapshot of every pool
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = ServerStatus {
        state: state.lifecycle.state(),
        pools: state.registry.status(),
    };
    Json(status)
}

#[derive(Serialize)]
struct ServerStatus {
    state: LifecycleState,
    pools: RegistryStatus,
}

/// Create the Axum router: configured endpoints plus `/health` and `/status`
pub fn create_router(state: AppState) -> Router {
    let endpoints = state.registry.router();
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
        .merge(endpoints)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::pipeline::mock::MockFactory;
    use crate::server::lifecycle::Lifecycle;
    use crate::server::registry::Registry;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        let config = ServerConfig::from_str(
            "dependencies: [{name: auth, min_size: 1, max_size: 2}]\napi: [{version: '1', route: /echo, depends: [auth], min_size: 1, max_size: 2}]",
        )
        .unwrap();
        let registry = Registry::build(&config, Arc::new(MockFactory::echo())).unwrap();
        AppState::new(Arc::new(registry), Arc::new(Lifecycle::new()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = create_test_state();
        let (code, body) = get_json(create_router(state.clone()), "/health").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["state"], "INIT");

        state.lifecycle.mark_serving();
        let (code, body) = get_json(create_router(state.clone()), "/health").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "SERVING");

        state.lifecycle.request_drain("test");
        let (code, _) = get_json(create_router(state), "/health").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (code, body) = get_json(create_router(create_test_state()), "/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["state"], "INIT");
        assert_eq!(body["pools"]["dependencies"][0]["name"], "auth");
        assert_eq!(body["pools"]["routes"][0]["name"], "/v1/echo");
        assert_eq!(body["pools"]["routes"][0]["idle"], 1);
    }

    #[tokio::test]
    async fn test_configured_endpoint_is_routed() {
        let (code, body) = get_json(create_router(create_test_state()), "/v1/echo?q=1").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, json!({"q": "1"}));
    }
}
