//! Server lifecycle: `INIT -> SERVING -> DRAINING -> STOPPED`.
//!
//! [`Server`] owns the current-thread runtime and the registry. [`serve`]
//! runs the listener until a drain is requested, then stops accepting,
//! deregisters endpoints, closes pools and sweeps the remaining tasks.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::pipeline::PipelineFactory;

use super::handlers::create_router;
use super::registry::Registry;
use super::state::AppState;
use super::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(u8)]
pub enum LifecycleState {
    Init = 0,
    Serving = 1,
    Draining = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Serving,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Serving => "SERVING",
            Self::Draining => "DRAINING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Shared lifecycle state plus the token that tells the listener to stop
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Init as u8),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `INIT -> SERVING`
    pub fn mark_serving(&self) -> bool {
        self.transition(LifecycleState::Init, LifecycleState::Serving)
    }

    /// Enter DRAINING and cancel the shutdown token. Only the first call
    /// wins; later calls are logged and ignored.
    pub fn request_drain(&self, reason: &str) -> bool {
        let entered = self.transition(LifecycleState::Serving, LifecycleState::Draining)
            || self.transition(LifecycleState::Init, LifecycleState::Draining);
        if entered {
            info!("Drain requested ({})", reason);
            self.shutdown.cancel();
        } else {
            info!(
                "Ignoring drain request ({}) while {}",
                reason,
                self.state()
            );
        }
        entered
    }

    /// `DRAINING -> STOPPED`
    pub fn mark_stopped(&self) -> bool {
        self.transition(LifecycleState::Draining, LifecycleState::Stopped)
    }
}

/// Outcome counts of the tasks swept during a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    pub cancelled: usize,
    pub failed: usize,
}

/// Background tasks owned by the server, swept on drain
#[derive(Default)]
pub struct ServerContext {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ServerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks.lock().push((name.into(), handle));
    }

    pub fn outstanding(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel every tracked task and await them together. Each outcome is
    /// counted, none is propagated.
    pub async fn sweep(&self) -> DrainReport {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let (names, handles): (Vec<String>, Vec<JoinHandle<()>>) = tasks.into_iter().unzip();
        for handle in &handles {
            handle.abort();
        }

        let mut report = DrainReport::default();
        for (name, outcome) in names.iter().zip(futures::future::join_all(handles).await) {
            match outcome {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_cancelled() => report.cancelled += 1,
                Err(e) => {
                    warn!("Task {} failed during drain: {}", name, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Turn SIGTERM and SIGINT into drain requests until cancelled.
#[cfg(unix)]
pub async fn watch_signals(lifecycle: Arc<Lifecycle>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    loop {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        lifecycle.request_drain(name);
    }
}

#[cfg(not(unix))]
pub async fn watch_signals(lifecycle: Arc<Lifecycle>) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        lifecycle.request_drain("Ctrl+C");
    }
}

// ============================================================================
// Serving and drain
// ============================================================================

/// Listener settings for [`serve`]
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// PEM certificate and key; plain HTTP when `None`
    pub tls: Option<(PathBuf, PathBuf)>,
    pub drain_timeout: Duration,
}

impl ServeOptions {
    pub fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        Ok(Self {
            tls: config.ssl.resolved_paths()?,
            drain_timeout: config.drain_timeout(),
        })
    }
}

/// Serve `state` on `listener` until a drain is requested, then drain.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    options: ServeOptions,
    ctx: Arc<ServerContext>,
) -> Result<DrainReport, ServerError> {
    let lifecycle = Arc::clone(&state.lifecycle);
    let registry = Arc::clone(&state.registry);
    let token = lifecycle.shutdown_token();
    let addr = listener.local_addr()?;
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let mut listener_task: JoinHandle<std::io::Result<()>> = match options.tls {
        None => {
            let shutdown = token.clone();
            info!("Serving HTTP on {}", addr);
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
            })
        }
        Some((cert, key)) => {
            use axum_server::tls_rustls::RustlsConfig;

            let rustls_config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .map_err(ServerError::Tls)?;
            let std_listener = listener.into_std()?;
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            let shutdown = token.clone();
            let grace = options.drain_timeout;
            ctx.spawn("tls-shutdown", async move {
                shutdown.cancelled().await;
                shutdown_handle.graceful_shutdown(Some(grace));
            });

            info!("Serving HTTPS on {}", addr);
            tokio::spawn(async move {
                axum_server::from_tcp_rustls(std_listener, rustls_config)
                    .handle(handle)
                    .serve(app)
                    .await
            })
        }
    };

    if !lifecycle.mark_serving() {
        // A drain arrived before the listener started
        debug!("Listener started while {}", lifecycle.state());
    }

    let mut listener_error = None;
    tokio::select! {
        _ = token.cancelled() => {
            let stopped = tokio::time::timeout(options.drain_timeout, &mut listener_task).await;
            match stopped {
                Ok(Ok(Ok(()))) => debug!("Listener stopped"),
                Ok(Ok(Err(e))) => warn!("Listener stopped with error: {}", e),
                Ok(Err(e)) => warn!("Listener task failed: {}", e),
                Err(_) => {
                    warn!(
                        "Listener still busy after {:?}, aborting",
                        options.drain_timeout
                    );
                    listener_task.abort();
                }
            }
        }
        outcome = &mut listener_task => {
            match outcome {
                Ok(Ok(())) => warn!("Listener exited without a drain request"),
                Ok(Err(e)) => {
                    error!("Listener failed: {}", e);
                    listener_error = Some(e);
                }
                Err(e) => error!("Listener task failed: {}", e),
            }
            lifecycle.request_drain("listener exit");
        }
    }

    let report = drain(&registry, &ctx).await;
    lifecycle.mark_stopped();
    info!("Stopped");

    match listener_error {
        Some(e) => Err(ServerError::Io(e)),
        None => Ok(report),
    }
}

/// Deregister, close pools, sweep tasks. Assumes the listener is stopped.
pub async fn drain(registry: &Registry, ctx: &ServerContext) -> DrainReport {
    registry.deregister_all();
    registry.close_pools();
    let report = ctx.sweep().await;
    debug!(
        "Drain swept {} tasks: {} completed, {} cancelled, {} failed",
        report.completed + report.cancelled + report.failed,
        report.completed,
        report.cancelled,
        report.failed
    );
    report
}

// ============================================================================
// Server
// ============================================================================

/// A configured server that has not started serving yet
pub struct Server {
    config: ServerConfig,
    state: AppState,
    runtime: Runtime,
    context: Arc<ServerContext>,
}

impl Server {
    /// Build the runtime, prepare the pipeline factory and every pool.
    pub fn new(config: ServerConfig, factory: Arc<dyn PipelineFactory>) -> Result<Self, ServerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        factory.set_log_level(config.log.level);
        for ext in &config.engine.ext {
            factory.load_extension(ext)?;
        }

        let registry = Registry::build(&config, factory)?;
        info!("Registered {} endpoints", registry.endpoints().len());

        Ok(Self {
            config,
            state: AppState::new(Arc::new(registry), Arc::new(Lifecycle::new())),
            runtime,
            context: Arc::new(ServerContext::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.state.registry
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.state.lifecycle
    }

    /// Bind, serve until a signal arrives, drain, and stop the runtime.
    pub fn run(self) -> Result<DrainReport, ServerError> {
        let Self {
            config,
            state,
            runtime,
            context,
        } = self;

        let result = runtime.block_on(async move {
            let options = ServeOptions::from_config(&config)?;
            let listener = TcpListener::bind(config.socket_addr()).await?;

            let lifecycle = Arc::clone(&state.lifecycle);
            context.spawn("signals", async move {
                if let Err(e) = watch_signals(lifecycle).await {
                    error!("Failed to install signal handlers: {}", e);
                }
            });

            serve(listener, state, options, context).await
        });

        runtime.shutdown_timeout(Duration::from_secs(1));
        info!("Completed");
        result
    }
}
