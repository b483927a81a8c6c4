//! Strata binary entry point.
//!
//! Runs one poller from the shared config file. Core functionality is
//! provided by the `strata` library crate.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata::collector::{ProtocolClient, RestClient};
use strata::config::{AppConfig, PollerConfig};
use strata::errors::PollerError;
use strata::poller::Poller;

/// Strata - Multi-Target Storage Telemetry Poller
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
struct Cli {
    /// Name of the poller to run, from the config's `pollers` section
    #[arg(short, long, env = "STRATA_POLLER")]
    poller: String,

    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/strata.yaml",
        env = "STRATA_CONFIG"
    )]
    config: String,

    /// Metrics/status server port (overrides config file)
    #[arg(long, env = "STRATA_PROM_PORT")]
    prom_port: Option<u16>,

    /// Service mode: plain log output without ANSI colors
    #[arg(long, env = "STRATA_DAEMON")]
    daemon: bool,
}

/// Resolve a collector name from the config into a protocol client.
fn build_client(
    name: &str,
    poller: &PollerConfig,
) -> Result<Box<dyn ProtocolClient>, PollerError> {
    match name {
        "Rest" => Ok(Box::new(RestClient::new(
            &poller.addr,
            poller.username.clone(),
            poller.password.clone(),
            poller.insecure_tls,
        )?)),
        other => Err(PollerError::Config(format!(
            "unknown collector protocol: {other}"
        ))),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,strata=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(!cli.daemon))
        .init();

    tracing::info!(config = %cli.config, poller = %cli.poller, "starting");
    let mut config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // CLI > ENV > config file.
    if let Some(port) = cli.prom_port {
        if let Some(poller) = config.pollers.get_mut(&cli.poller) {
            let mut server = poller.server();
            server.port = port;
            poller.server = Some(server);
        }
    }

    let poller = match Poller::new(&cli.poller, &config, &build_client) {
        Ok(poller) => poller,
        Err(e) => {
            tracing::error!(poller = %cli.poller, error = %e, "failed to start poller");
            std::process::exit(1);
        }
    };
    tracing::info!(
        poller = %poller.name(),
        collectors = poller.collector_count(),
        "poller initialized"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        signal_cancel.cancel();
    });

    if let Err(e) = poller.run(cancel).await {
        tracing::error!(error = %e, "poller failed");
        std::process::exit(1);
    }
    tracing::info!("shutdown complete");
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
