//! Pipeline collaborator interface
//!
//! The pool and dispatcher only ever see the traits in this module: a
//! [`PipelineFactory`] builds named [`Worker`]s from a [`PipelineConfig`],
//! and a worker turns an [`Envelope`] into an [`Invocation`]. The built-in
//! digraph engine lives in [`engine`]; any other engine plugs in by
//! implementing the same traits.

pub mod engine;
pub mod nodes;

#[cfg(test)]
pub(crate) mod mock;

pub use engine::{BuiltinFactory, DigraphWorker};
pub use nodes::{NodeKind, NodeSpec};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{LogLevel, PipelineConfig};

/// Errors raised by the pipeline engine
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown extension: {0}")]
    UnknownExtension(String),

    #[error("Node '{node}' requires extension '{extension}' which is not loaded")]
    ExtensionNotLoaded { node: String, extension: String },

    #[error("Invalid node definition: {0}")]
    InvalidNode(String),

    #[error("Duplicate node name: '{0}'")]
    DuplicateNode(String),

    #[error("Edge '{0}' is not of the form 'from -> to'")]
    InvalidEdge(String),

    #[error("Node '{0}' referenced in digraph is not defined")]
    UndefinedNode(String),

    #[error("Digraph contains a cycle")]
    Cycle,

    #[error("Pipeline has no nodes")]
    Empty,

    #[error("Invocation failed: {0}")]
    Invocation(String),
}

/// Per-request input handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: Map<String, Value>,
    pub param: Value,
    /// `[host, port]` of the peer, `null` when unknown
    pub client: Value,
}

impl Envelope {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "headers": self.headers,
            "param": self.param,
            "client": self.client,
        })
    }
}

/// What a pipeline run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Result and status code pair; a status other than 0 means the pipeline
/// failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub result: PipelineResult,
    pub status: i64,
}

impl Invocation {
    pub fn success(result: PipelineResult) -> Self {
        Self { result, status: 0 }
    }

    pub fn failure(status: i64) -> Self {
        Self {
            result: PipelineResult::default(),
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// A stateful execution unit. Never invoked by two callers at once; the
/// pool hands out exclusive ownership.
#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &str;

    async fn invoke(&mut self, envelope: &Envelope) -> Result<Invocation, PipelineError>;
}

/// Builds workers for a pipeline definition
pub trait PipelineFactory: Send + Sync {
    /// Receive the server's configured log level.
    fn set_log_level(&self, _level: LogLevel) {}

    /// Load a named extension before any worker is built.
    fn load_extension(&self, name: &str) -> Result<(), PipelineError>;

    /// Construct one worker. Must not block on I/O.
    fn build(&self, config: &PipelineConfig, name: &str) -> Result<Box<dyn Worker>, PipelineError>;
}
