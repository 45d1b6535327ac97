use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::merge::deep_merge;

/// Errors that can occur while parsing and validating server settings
#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("Config parse error: {0}")]
    ParseError(String),

    #[error("ssl.enabled requires both ssl.cert and ssl.key")]
    IncompleteSsl,

    #[error("Route '{0}' must start with '/'")]
    InvalidRoute(String),

    #[error("Version '{0}' is not a dotted list of segments")]
    InvalidVersion(String),

    #[error("Dependency name must not be empty")]
    EmptyDependencyName,

    #[error("Duplicate dependency name: '{0}'")]
    DuplicateDependency(String),
}

/// Log levels accepted in `log.level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `tracing` filter directive this level maps to.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Critical | Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl SslConfig {
    /// Resolve the certificate and key paths, expanding `~` and `$VAR`.
    /// Returns `None` when TLS is disabled.
    pub fn resolved_paths(&self) -> Result<Option<(PathBuf, PathBuf)>, SettingsError> {
        if !self.enabled {
            return Ok(None);
        }
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Ok(Some((expand_path(cert), expand_path(key)))),
            _ => Err(SettingsError::IncompleteSsl),
        }
    }
}

/// Expand `~` and environment variables in a path, falling back to the raw
/// string when a variable is undefined.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}

/// Extensions loaded into the pipeline engine at startup
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub ext: Vec<String>,
}

/// Pipeline definition handed to the pipeline engine when a worker is built
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Node definitions, interpreted by the engine
    #[serde(default)]
    pub node: Vec<Value>,
    /// Edges between nodes, `"from -> to"`
    #[serde(default)]
    pub digraph: Vec<String>,
    /// Terminal node whose output becomes the result
    #[serde(default)]
    pub last: Option<String>,
}

/// Sizing shared by dependency and API entries
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PoolSettings {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Seconds to wait for a free worker; 0 waits forever
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout > 0).then(|| Duration::from_secs(self.acquire_timeout))
    }
}

fn default_min_size() -> usize {
    4
}

fn default_max_size() -> usize {
    8
}

fn default_acquire_timeout() -> u64 {
    30
}

/// A named pipeline usable as a pre-handler by API entries
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DependencyConfig {
    pub name: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

/// A pipeline exposed as an HTTP endpoint
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub route: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(flatten)]
    pub pool: PoolSettings,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
}

fn default_version() -> String {
    "0.0".to_string()
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string()]
}

impl ApiConfig {
    /// The path this entry is served at, e.g. version `2.1` and route
    /// `/users` give `/v2/1/users`.
    pub fn versioned_path(&self) -> String {
        versioned_path(&self.version, &self.route)
    }
}

/// Build `"/v" + version segments joined by "/" + route`.
pub fn versioned_path(version: &str, route: &str) -> String {
    let segments: Vec<&str> = version.split('.').collect();
    format!("/v{}{}", segments.join("/"), route)
}

/// Top-level server configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
    #[serde(default)]
    pub api: Vec<ApiConfig>,
    /// Seconds the listener gets to finish in-flight connections on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

fn default_port() -> u16 {
    1979
}

fn default_drain_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: default_port(),
            log: LogConfig::default(),
            ssl: SslConfig::default(),
            engine: EngineConfig::default(),
            dependencies: Vec::new(),
            api: Vec::new(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Merge a user-provided document over the default configuration.
/// Nested sections keep every default they do not override.
pub fn merge_over_defaults(user: Value) -> Result<ServerConfig, SettingsError> {
    let mut merged = serde_json::to_value(ServerConfig::default())
        .map_err(|e| SettingsError::ParseError(e.to_string()))?;
    if !user.is_null() {
        deep_merge(&mut merged, user);
    }
    serde_json::from_value(merged).map_err(|e| SettingsError::ParseError(e.to_string()))
}

/// Parse a YAML (or JSON) document into a validated configuration.
pub fn parse_settings(content: &str) -> Result<ServerConfig, SettingsError> {
    let user: Value =
        serde_yaml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))?;
    let config = merge_over_defaults(user)?;
    validate_settings(&config)?;
    Ok(config)
}

/// Validate a configuration for consistency.
///
/// Pool sizing and dependency resolution are checked when the registry is
/// built, since that is where pools come into existence.
pub fn validate_settings(config: &ServerConfig) -> Result<(), SettingsError> {
    config.ssl.resolved_paths()?;

    let mut seen = HashSet::new();
    for dep in &config.dependencies {
        if dep.name.is_empty() {
            return Err(SettingsError::EmptyDependencyName);
        }
        if !seen.insert(dep.name.as_str()) {
            return Err(SettingsError::DuplicateDependency(dep.name.clone()));
        }
    }

    for api in &config.api {
        // Parameters are written `{name}`; `:name` and `*rest` are rejected by the router
        if !api.route.starts_with('/')
            || api
                .route
                .split('/')
                .any(|s| s.starts_with(':') || s.starts_with('*'))
        {
            return Err(SettingsError::InvalidRoute(api.route.clone()));
        }
        if api.version.split('.').any(|s| s.is_empty() || s.contains('/')) {
            return Err(SettingsError::InvalidVersion(api.version.clone()));
        }
    }

    Ok(())
}

impl ServerConfig {
    /// Parse and validate from a YAML or JSON string.
    /// Pure function - no I/O.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, SettingsError> {
        parse_settings(content)
    }

    /// Address to bind, `127.0.0.1` when unset.
    pub fn bind_address(&self) -> &str {
        self.address.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address(), self.port)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}
