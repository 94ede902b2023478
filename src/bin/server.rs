//! Chat server entry point.
//!
//! `server [port]` with optional `--config <file>`; see `--help`.

use relay_chat::config::{Config, ConfigError};
use relay_chat::runtime::Server;
use std::process::ExitCode;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Cli(e)) if !e.use_stderr() => {
            // --help / --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        db_path = %config.db_path.display(),
        max_connections = config.max_connections,
        "Starting relay-chat server"
    );

    match serve(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}

fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config)?;
    let handle = server.handle();

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Cannot start signal handler");
                    return;
                }
            };
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Received Ctrl-C, shutting down");
                        handle.shutdown();
                    }
                    Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
                }
            });
        })?;

    server.run()?;
    Ok(())
}
