use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use probeguard::api::{ApiServer, AppState};
use probeguard::config::{LoggingConfig, ProbeGuardConfig};
use probeguard::prober::HttpProber;
use probeguard::ratelimit::MonotonicClock;

/// Rate-limited HTTP front end for an endpoint prober.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "PROBEGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging comes from the config, so it cannot be up before loading.
    let mut config = ProbeGuardConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Probeguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        endpoints = config.prober.endpoints.len(),
        policies = config.rate_limits.len(),
        "Configuration loaded"
    );

    let prober = Arc::new(HttpProber::new(&config.prober)?);
    let state = AppState::new(&config, prober, Arc::new(MonotonicClock::new()))?;
    info!("Rate limit policies initialized");

    let server = ApiServer::new(config.server.listen_addr, Arc::new(state));

    // Stops accepting connections at the first shutdown signal.
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Probeguard stopped");
    Ok(())
}

/// `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!(signal = "SIGINT", "Stopping probe API");
        }
        _ = terminate => {
            info!(signal = "SIGTERM", "Stopping probe API");
        }
    }
}
