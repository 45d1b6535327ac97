//! Scriptable workers for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{Envelope, Invocation, PipelineError, PipelineFactory, PipelineResult, Worker};
use crate::config::PipelineConfig;

/// How every worker built by a [`MockFactory`] answers
#[derive(Debug, Clone)]
pub enum Reply {
    /// Echo the envelope's `param` as the body
    EchoParam,
    /// Fixed result and status
    Fixed(PipelineResult, i64),
    /// Return an error instead of a status
    Raise,
}

#[derive(Default)]
pub struct Calls {
    /// `(worker name, envelope)` in invocation order
    pub log: Mutex<Vec<(String, Envelope)>>,
    pub built: AtomicUsize,
}

pub struct MockFactory {
    reply: Reply,
    pub calls: Arc<Calls>,
    fail_build: bool,
}

impl MockFactory {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: Arc::new(Calls::default()),
            fail_build: false,
        }
    }

    pub fn echo() -> Self {
        Self::new(Reply::EchoParam)
    }

    pub fn fixed(body: Value, headers: Map<String, Value>, status: i64) -> Self {
        Self::new(Reply::Fixed(
            PipelineResult {
                headers: Some(headers),
                body: Some(body),
            },
            status,
        ))
    }

    pub fn failing_build() -> Self {
        Self {
            fail_build: true,
            ..Self::echo()
        }
    }
}

impl PipelineFactory for MockFactory {
    fn load_extension(&self, name: &str) -> Result<(), PipelineError> {
        Err(PipelineError::UnknownExtension(name.to_string()))
    }

    fn build(&self, _config: &PipelineConfig, name: &str) -> Result<Box<dyn Worker>, PipelineError> {
        if self.fail_build {
            return Err(PipelineError::Empty);
        }
        self.calls.built.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockWorker {
            name: name.to_string(),
            reply: self.reply.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

pub struct MockWorker {
    name: String,
    reply: Reply,
    calls: Arc<Calls>,
}

#[async_trait]
impl Worker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&mut self, envelope: &Envelope) -> Result<Invocation, PipelineError> {
        self.calls
            .log
            .lock()
            .push((self.name.clone(), envelope.clone()));
        match &self.reply {
            Reply::EchoParam => Ok(Invocation::success(PipelineResult {
                headers: None,
                body: Some(envelope.param.clone()),
            })),
            Reply::Fixed(result, status) => Ok(Invocation {
                result: result.clone(),
                status: *status,
            }),
            Reply::Raise => Err(PipelineError::Invocation("boom".to_string())),
        }
    }
}
