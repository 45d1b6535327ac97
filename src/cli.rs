use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{expand_path, LogLevel, ServerConfig};
use crate::server::Registry;

#[derive(Parser, Debug)]
#[command(name = "flowapi")]
#[command(about = "Serve configured pipelines as pooled HTTP endpoints")]
#[command(version)]
pub struct Args {
    /// Path to the server configuration file (YAML or JSON)
    #[arg(short, long, value_name = "FILE", default_value = "flowapi-server.yaml")]
    pub config: PathBuf,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: build every pool and show the endpoint table without serving
    #[arg(long)]
    pub dry_run: bool,

    /// Override the configured bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the configured port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file loaded before the configuration
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

impl Args {
    /// Config path with `~` and `$VAR` expanded
    pub fn config_path(&self) -> PathBuf {
        expand_path(&self.config.to_string_lossy())
    }

    /// Apply command-line overrides to a loaded configuration.
    pub fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(ref addr) = self.bind_addr {
            config.address = Some(addr.clone());
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }

    /// Filter directive when `RUST_LOG` is unset: `-v` count first, then
    /// the configured level.
    pub fn log_filter(&self, configured: Option<LogLevel>) -> &'static str {
        match self.verbose {
            0 => configured.unwrap_or_default().as_filter(),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format a dry-run output showing every pool and endpoint.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &ServerConfig, registry: &Registry, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "flowapi v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n", args.config.display()));
    let scheme = if config.ssl.enabled { "https" } else { "http" };
    output.push_str(&format!("Listen: {}://{}\n", scheme, config.socket_addr()));
    if !config.engine.ext.is_empty() {
        output.push_str(&format!("Extensions: {}\n", config.engine.ext.join(", ")));
    }
    output.push('\n');

    let status = registry.status();

    output.push_str(&format!("Dependencies ({}):\n", status.dependencies.len()));
    for pool in &status.dependencies {
        output.push_str(&format!(
            "  - {} [pool {}..{}]\n",
            pool.name, pool.min_size, pool.max_size
        ));
    }
    output.push('\n');

    output.push_str(&format!("Endpoints ({}):\n", registry.endpoints().len()));
    for endpoint in registry.endpoints() {
        let methods: Vec<&str> = endpoint.methods().iter().map(|m| m.as_str()).collect();
        output.push_str(&format!("  {:<12} {}", methods.join(","), endpoint.path()));
        let deps = endpoint.dependencies();
        if !deps.is_empty() {
            output.push_str(&format!("  <- {}", deps.join(" -> ")));
        }
        output.push('\n');
    }
    output.push('\n');

    output.push_str("Route pools:\n");
    for pool in &status.routes {
        output.push_str(&format!(
            "  {} [pool {}..{}]\n",
            pool.name, pool.min_size, pool.max_size
        ));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to serve. Remove --dry-run to start.\n");

    output
}
