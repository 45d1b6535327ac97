//! Serve configured execution pipelines as versioned HTTP endpoints.
//!
//! Each endpoint and named dependency owns a bounded [`pool::WorkerPool`] of
//! pre-warmed workers built by a [`pipeline::PipelineFactory`]. The
//! [`server::Registry`] wires them into an axum router, and
//! [`server::Server`] runs it on a single-threaded runtime with an ordered
//! graceful drain on SIGTERM/SIGINT.

pub mod cli;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod server;
