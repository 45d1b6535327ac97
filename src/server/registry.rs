//! Endpoint registry.
//!
//! Builds one pool per named dependency and one per distinct versioned API
//! path, composes each API entry's dependency stages ahead of its main
//! dispatcher, and turns the result into an axum [`Router`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::pipeline::PipelineFactory;
use crate::pool::{PoolError, PoolStatus, WorkerPool};

use super::dispatch::{DispatchError, DispatchOutcome, Dispatcher, InboundRequest};

/// Errors raised while registering endpoints
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Route '{route}' depends on undefined dependency '{name}'")]
    UnresolvedDependency { route: String, name: String },

    #[error("Method {method} declared more than once for '{path}'")]
    DuplicateRoute { path: String, method: Method },

    #[error("Invalid HTTP method '{method}' for '{path}'")]
    InvalidMethod { path: String, method: String },

    #[error("Route '{0}' declares no methods")]
    NoMethods(String),

    #[error("Route '{path}' conflicts with '{existing}'")]
    RouteConflict { path: String, existing: String },
}

/// One step of an endpoint's handler chain
pub enum Stage {
    /// Named pre-handler; its output is discarded
    Dependency {
        name: String,
        dispatcher: Arc<Dispatcher>,
    },
    /// The endpoint's own pipeline, whose output is the response
    Main(Arc<Dispatcher>),
}

/// Threaded through the stages of one request
#[derive(Debug, Default)]
pub struct StageContext {
    pub completed: Vec<String>,
    pub response: Option<DispatchOutcome>,
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Self::Dependency { name, .. } => name,
            Self::Main(dispatcher) => dispatcher.pool().name(),
        }
    }

    pub async fn run(
        &self,
        request: &InboundRequest,
        mut ctx: StageContext,
    ) -> Result<StageContext, DispatchError> {
        match self {
            Self::Dependency { name, dispatcher } => {
                dispatcher.run(request).await?;
                debug!("Request {} passed dependency {}", request.request_id, name);
            }
            Self::Main(dispatcher) => {
                ctx.response = Some(dispatcher.run(request).await?);
            }
        }
        ctx.completed.push(self.name().to_string());
        Ok(ctx)
    }
}

/// A versioned path plus the chain serving it
pub struct Endpoint {
    path: String,
    methods: Vec<Method>,
    stages: Vec<Stage>,
    registered: AtomicBool,
}

impl Endpoint {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Names of the dependency stages, in execution order
    pub fn dependencies(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|stage| match stage {
                Stage::Dependency { name, .. } => Some(name.as_str()),
                Stage::Main(_) => None,
            })
            .collect()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Run every stage in order. The first failure ends the chain and
    /// becomes the response.
    pub async fn handle(&self, request: &InboundRequest) -> Response {
        if !self.is_registered() {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "detail": "Not Found" })),
            )
                .into_response();
        }

        let mut ctx = StageContext::default();
        for stage in &self.stages {
            ctx = match stage.run(request, ctx).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(
                        "Request {} to {} failed at {}: {}",
                        request.request_id,
                        self.path,
                        stage.name(),
                        e
                    );
                    return e.into_response();
                }
            };
        }

        ctx.response.unwrap_or_default().into_response()
    }

    /// Entry point wired into the router
    pub async fn serve(&self, request: Request) -> Response {
        let inbound = match InboundRequest::from_request(request).await {
            Ok(inbound) => inbound,
            Err(e) => return e.into_response(),
        };
        debug!(
            "Request {} {} {}",
            inbound.request_id, inbound.method, self.path
        );

        let span = info_span!("request", id = %inbound.request_id);
        let mut response = self.handle(&inbound).instrument(span).await;
        if let Ok(value) = HeaderValue::from_str(&inbound.request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
}

/// Snapshot of every pool, keyed by role
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub dependencies: Vec<PoolStatus>,
    pub routes: Vec<PoolStatus>,
}

/// All dependency pools, route pools and endpoints of a server
pub struct Registry {
    dependencies: BTreeMap<String, Arc<Dispatcher>>,
    routes: BTreeMap<String, Arc<WorkerPool>>,
    endpoints: Vec<Arc<Endpoint>>,
}

// ============================================================================
// SBIO: Pure method and path parsing
// ============================================================================

/// Parse the configured method names for `path`. Each must be a method the
/// router can filter on.
pub fn parse_methods(path: &str, raw: &[String]) -> Result<Vec<Method>, RegistryError> {
    if raw.is_empty() {
        return Err(RegistryError::NoMethods(path.to_string()));
    }
    raw.iter()
        .map(|name| {
            let invalid = || RegistryError::InvalidMethod {
                path: path.to_string(),
                method: name.clone(),
            };
            let method =
                Method::from_bytes(name.trim().to_uppercase().as_bytes()).map_err(|_| invalid())?;
            MethodFilter::try_from(method.clone()).map_err(|_| invalid())?;
            Ok(method)
        })
        .collect()
}

/// `path` with every `{param}` collapsed to `{}`; two paths with the same
/// shape match the same requests.
pub fn route_shape(path: &str) -> String {
    let mut shape = String::with_capacity(path.len());
    let mut in_param = false;
    for c in path.chars() {
        match c {
            '{' if !in_param => {
                in_param = true;
                shape.push('{');
            }
            '}' if in_param => {
                in_param = false;
                shape.push('}');
            }
            _ if in_param => {}
            _ => shape.push(c),
        }
    }
    shape
}

impl Registry {
    /// Build every pool and endpoint described by `config`.
    ///
    /// API entries sharing a versioned path share one pool, built from the
    /// first entry's pipeline and sizing.
    pub fn build(
        config: &ServerConfig,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<Self, RegistryError> {
        let mut dependencies = BTreeMap::new();
        for dep in &config.dependencies {
            let pool = WorkerPool::new(
                dep.name.clone(),
                dep.pipeline.clone(),
                dep.pool,
                Arc::clone(&factory),
            )?;
            info!("Registered dependency {}", dep.name);
            dependencies.insert(
                dep.name.clone(),
                Arc::new(Dispatcher::new(Arc::new(pool))),
            );
        }

        let mut routes: BTreeMap<String, Arc<WorkerPool>> = BTreeMap::new();
        let mut claimed: HashSet<(String, Method)> = HashSet::new();
        let mut shapes: HashMap<String, String> = HashMap::new();
        let mut endpoints = Vec::with_capacity(config.api.len());

        for api in &config.api {
            let path = api.versioned_path();
            let methods = parse_methods(&path, &api.methods)?;
            // The router rejects paths differing only in parameter names
            let existing = shapes.entry(route_shape(&path)).or_insert_with(|| path.clone());
            if *existing != path {
                return Err(RegistryError::RouteConflict {
                    path,
                    existing: existing.clone(),
                });
            }
            for method in &methods {
                if !claimed.insert((path.clone(), method.clone())) {
                    return Err(RegistryError::DuplicateRoute {
                        path,
                        method: method.clone(),
                    });
                }
            }

            let mut stages = Vec::with_capacity(api.depends.len() + 1);
            for name in &api.depends {
                let dispatcher =
                    dependencies
                        .get(name)
                        .ok_or_else(|| RegistryError::UnresolvedDependency {
                            route: path.clone(),
                            name: name.clone(),
                        })?;
                stages.push(Stage::Dependency {
                    name: name.clone(),
                    dispatcher: Arc::clone(dispatcher),
                });
            }

            let pool = match routes.get(&path) {
                Some(pool) => Arc::clone(pool),
                None => {
                    let pool = Arc::new(WorkerPool::new(
                        path.clone(),
                        api.pipeline.clone(),
                        api.pool,
                        Arc::clone(&factory),
                    )?);
                    routes.insert(path.clone(), Arc::clone(&pool));
                    pool
                }
            };
            stages.push(Stage::Main(Arc::new(Dispatcher::new(pool))));

            info!(
                "Registered {} {:?} (depends: {:?})",
                path, api.methods, api.depends
            );
            endpoints.push(Arc::new(Endpoint {
                path,
                methods,
                stages,
                registered: AtomicBool::new(true),
            }));
        }

        Ok(Self {
            dependencies,
            routes,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn dependency(&self, name: &str) -> Option<&Arc<Dispatcher>> {
        self.dependencies.get(name)
    }

    pub fn route_pool(&self, path: &str) -> Option<&Arc<WorkerPool>> {
        self.routes.get(path)
    }

    /// Router with one method router per path
    pub fn router(&self) -> Router {
        let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
        for endpoint in &self.endpoints {
            for method in &endpoint.methods {
                let Ok(filter) = MethodFilter::try_from(method.clone()) else {
                    warn!("Skipping unroutable method {} on {}", method, endpoint.path);
                    continue;
                };
                let ep = Arc::clone(endpoint);
                let handler = move |request: Request| {
                    let ep = Arc::clone(&ep);
                    async move { ep.serve(request).await }
                };
                let methods = by_path
                    .remove(&endpoint.path)
                    .unwrap_or_else(MethodRouter::new);
                by_path.insert(endpoint.path.clone(), methods.on(filter, handler));
            }
        }

        by_path
            .into_iter()
            .fold(Router::new(), |router, (path, methods)| {
                router.route(&path, methods)
            })
    }

    /// Make every endpoint answer 404. Returns how many were live.
    pub fn deregister_all(&self) -> usize {
        let count = self
            .endpoints
            .iter()
            .filter(|e| e.registered.swap(false, Ordering::AcqRel))
            .count();
        info!("Deregistered {} endpoints", count);
        count
    }

    /// Close every route pool, then every dependency pool.
    pub fn close_pools(&self) {
        for pool in self.routes.values() {
            pool.close();
        }
        for dispatcher in self.dependencies.values() {
            dispatcher.pool().close();
        }
    }

    pub fn status(&self) -> RegistryStatus {
        RegistryStatus {
            dependencies: self
                .dependencies
                .values()
                .map(|d| d.pool().status())
                .collect(),
            routes: self.routes.values().map(|p| p.status()).collect(),
        }
    }
}
