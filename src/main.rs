use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowapi::cli::{format_dry_run, Args};
use flowapi::config::{load_config_file, LogLevel};
use flowapi::pipeline::BuiltinFactory;
use flowapi::server::Server;

fn init_tracing(args: &Args, configured: Option<LogLevel>) {
    let filter = args.log_filter(configured);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

fn main() {
    let args = Args::parse();

    // Load .env file if specified, before the config is read
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            init_tracing(&args, None);
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let config_path = args.config_path();
    let mut config = match load_config_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(&args, None);
            error!(
                "Failed to load config file {}: {}",
                config_path.display(),
                e
            );
            process::exit(1);
        }
    };
    args.apply_overrides(&mut config);
    init_tracing(&args, Some(config.log.level));

    info!("Loaded config from {}", config_path.display());

    let server = match Server::new(config, Arc::new(BuiltinFactory::new())) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialise server: {}", e);
            process::exit(1);
        }
    };

    // Dry-run mode: print the endpoint table and exit
    if args.dry_run {
        let output = format_dry_run(server.config(), server.registry(), &args);
        println!("{}", output);
        return;
    }

    match server.run() {
        Ok(report) => info!(
            "Drained: {} completed, {} cancelled, {} failed",
            report.completed, report.cancelled, report.failed
        ),
        Err(e) => {
            error!("Server error: {}", e);
            process::exit(1);
        }
    }
}
