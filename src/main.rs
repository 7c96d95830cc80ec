use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hopgate::{Config, ProxyServer};

/// Local forwarding proxy with upstream dispatch and helper-process
/// supervision.
#[derive(Parser)]
#[clap(name = "hopgate", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[clap(short, long, default_value = "hopgate.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        match Config::load(&cli.config) {
            Ok(config) => config,
            Err(err) => {
                error!("invalid configuration: {err:#}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        info!(path = %cli.config.display(), "no configuration file found, using defaults");
        Config::default()
    };

    let mut server = match ProxyServer::start(config).await {
        Ok(server) => server,
        Err(err) => {
            error!("startup failed: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    // Interactive interrupt and process termination converge on the same
    // idempotent shutdown path.
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("failed to wait for the shutdown signal: {err:#}");
            }
        }
        _ = terminate_signal() => {}
    }
    info!("shutdown signal received");
    server.shutdown().await;
    ExitCode::SUCCESS
}

/// Resolves when the process is asked to exit (SIGTERM on unix). On
/// platforms without such a signal this never resolves and ctrl-c is the
/// only trigger.
#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            terminate.recv().await;
        }
        Err(err) => {
            error!("failed to install the terminate handler: {err:#}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}
