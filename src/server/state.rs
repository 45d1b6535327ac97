use std::sync::Arc;

use crate::server::lifecycle::{Lifecycle, LifecycleState};
use crate::server::registry::Registry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<Lifecycle>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            registry,
            lifecycle,
        }
    }

    /// True while requests are being accepted
    pub fn is_serving(&self) -> bool {
        self.lifecycle.state() == LifecycleState::Serving
    }
}
