pub mod dispatch;
pub mod handlers;
pub mod lifecycle;
pub mod registry;
pub mod state;

pub use dispatch::{DispatchError, DispatchOutcome, Dispatcher, HandlerKind, InboundRequest};
pub use handlers::create_router;
pub use lifecycle::{
    drain, serve, watch_signals, DrainReport, Lifecycle, LifecycleState, ServeOptions, Server,
    ServerContext,
};
pub use registry::{Endpoint, Registry, RegistryError, RegistryStatus, Stage, StageContext};
pub use state::AppState;

use thiserror::Error;

use crate::config::SettingsError;
use crate::pipeline::PipelineError;

/// Startup and serving errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("TLS setup failed: {0}")]
    Tls(std::io::Error),
}
