//! n8n-host-agent
//!
//! Usage:
//! - `n8n-host-agent serve`                 HTTP API + watchdog
//! - `n8n-host-agent check --attempts 30`   poll n8n until it responds
//! - `n8n-host-agent repair`                probe, backup, restart, verify
//! - `n8n-host-agent backup create --push`  archive the data dir
//! - `n8n-host-agent cron sync`             install the managed crontab entries

use clap::Parser;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use n8n_host_agent::cli::{self, Cli};
use n8n_host_agent::config::EnvConfig;
use n8n_host_agent::state::trigger_shutdown;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = EnvConfig::from_env();

    tokio::spawn(async {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        trigger_shutdown();
    });

    let code = match cli::run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
