//! Per-request dispatch onto a worker pool.
//!
//! A [`Dispatcher`] turns an [`InboundRequest`] into an [`Envelope`], borrows
//! a worker, invokes it and interprets the `(result, status)` pair. Only GET
//! and POST are mapped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, Path, Query, Request},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::deep_merge;
use crate::pipeline::{Envelope, PipelineError};
use crate::pool::{PoolError, WorkerPool};

/// Largest request body read for POST
pub const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Detail returned to clients for any pipeline-side failure
pub const PROCESS_FAILED: &str = "Requested process failed";

/// Errors surfaced while dispatching one request
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Method {0} is not mapped")]
    MethodNotMapped(Method),

    #[error("Request decode error: {0}")]
    Decode(String),

    #[error("Pipeline returned status {status}")]
    PipelineFailure { status: i64 },

    #[error("Worker invocation failed: {0}")]
    Invocation(#[from] PipelineError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            Self::MethodNotMapped(_) => (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string()),
            Self::Decode(msg) => (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", msg)),
            Self::Pool(PoolError::Exhausted { .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No worker available".to_string(),
            ),
            Self::PipelineFailure { .. } | Self::Invocation(_) | Self::Pool(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, PROCESS_FAILED.to_string())
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Closed table of handlers, one per mapped method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Get,
    Post,
}

impl HandlerKind {
    pub fn for_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET => Some(Self::Get),
            Method::POST => Some(Self::Post),
            _ => None,
        }
    }
}

/// Longer caller-supplied request ids are replaced
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// The parts of an HTTP request a dispatcher needs, read once and shared by
/// every stage of an endpoint.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Caller's `x-request-id` when usable, otherwise a fresh UUID
    pub request_id: String,
    pub method: Method,
    pub headers: Map<String, Value>,
    pub query: Map<String, Value>,
    pub path_params: Map<String, Value>,
    pub client: Option<SocketAddr>,
    /// Only read for POST
    pub body: Bytes,
}

impl InboundRequest {
    /// Read an axum request. The body is consumed only for POST.
    pub async fn from_request(request: Request) -> Result<Self, DispatchError> {
        let (mut parts, body) = request.into_parts();

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.len() <= MAX_REQUEST_ID_LEN)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut headers = Map::new();
        for (name, value) in &parts.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers.insert(name.as_str().to_string(), Value::String(value));
        }

        let query = match parts.uri.query() {
            Some(_) => Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
                .map_err(|e| DispatchError::Decode(e.body_text()))?
                .0,
            None => HashMap::new(),
        };

        let path_params = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
            .await
            .map(|Path(params)| params)
            .unwrap_or_default();

        let client = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let body = if parts.method == Method::POST {
            axum::body::to_bytes(body, BODY_LIMIT)
                .await
                .map_err(|e| DispatchError::Decode(e.to_string()))?
        } else {
            Bytes::new()
        };

        Ok(Self {
            request_id,
            method: parts.method,
            headers,
            query: to_object(query),
            path_params: to_object(path_params),
            client,
            body,
        })
    }

    /// `[host, port]` of the peer, `null` when unknown
    pub fn client_value(&self) -> Value {
        match self.client {
            Some(addr) => json!([addr.ip().to_string(), addr.port()]),
            None => Value::Null,
        }
    }
}

fn to_object(map: HashMap<String, String>) -> Map<String, Value> {
    map.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
}

// ============================================================================
// SBIO: Pure envelope construction
// ============================================================================

/// GET: query parameters merged with path parameters, path winning.
pub fn get_envelope(request: &InboundRequest) -> Envelope {
    let mut param = Value::Object(request.query.clone());
    deep_merge(&mut param, Value::Object(request.path_params.clone()));
    Envelope {
        headers: request.headers.clone(),
        param,
        client: request.client_value(),
    }
}

/// POST: JSON body merged with path parameters, path winning.
pub fn post_envelope(request: &InboundRequest) -> Result<Envelope, DispatchError> {
    let mut param: Value =
        serde_json::from_slice(&request.body).map_err(|e| DispatchError::Decode(e.to_string()))?;

    if !request.path_params.is_empty() {
        if !param.is_object() {
            return Err(DispatchError::Decode(
                "body must be a JSON object on routes with path parameters".to_string(),
            ));
        }
        deep_merge(&mut param, Value::Object(request.path_params.clone()));
    }

    Ok(Envelope {
        headers: request.headers.clone(),
        param,
        client: request.client_value(),
    })
}

/// Successful pipeline output, ready to become an HTTP response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchOutcome {
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
}

impl IntoResponse for DispatchOutcome {
    fn into_response(self) -> Response {
        let mut response = match self.body {
            Some(body) => Json(body).into_response(),
            None => StatusCode::OK.into_response(),
        };

        for (name, value) in self.headers {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => warn!("Skipping invalid result header '{}'", name),
            }
        }

        response
    }
}

/// Runs requests against one worker pool
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Build the envelope for the request's method and execute it.
    pub async fn run(&self, request: &InboundRequest) -> Result<DispatchOutcome, DispatchError> {
        let envelope = match HandlerKind::for_method(&request.method) {
            Some(HandlerKind::Get) => get_envelope(request),
            Some(HandlerKind::Post) => post_envelope(request)?,
            None => return Err(DispatchError::MethodNotMapped(request.method.clone())),
        };
        self.execute(&envelope).await
    }

    /// Invoke a pooled worker. The worker goes back to the pool whatever
    /// the invocation returns.
    pub async fn execute(&self, envelope: &Envelope) -> Result<DispatchOutcome, DispatchError> {
        let invocation = {
            let mut worker = self.pool.acquire().await?;
            debug!("Pool {} lent {}", self.pool.name(), worker.name());
            let invocation = worker.invoke(envelope).await;
            self.pool.release(worker);
            invocation
        };

        let invocation = invocation.map_err(|e| {
            warn!("Pool {} worker raised: {}", self.pool.name(), e);
            DispatchError::Invocation(e)
        })?;

        if !invocation.is_success() {
            warn!(
                "Pool {} pipeline failed with status {}",
                self.pool.name(),
                invocation.status
            );
            return Err(DispatchError::PipelineFailure {
                status: invocation.status,
            });
        }

        Ok(DispatchOutcome {
            headers: invocation.result.headers.unwrap_or_default(),
            body: invocation.result.body,
        })
    }
}
