//! n8n host agent
//!
//! 单机 n8n 的探测、修复、备份与 crontab 管理

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod services;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::{get_shutdown_token, AppState};

/// 后台清理间隔
const CLEANUP_INTERVAL_SECS: u64 = 600;

/// 启动 HTTP API、看门狗与清理任务，直到收到 shutdown
pub async fn run_server(state: Arc<AppState>, port_override: Option<u16>) -> anyhow::Result<()> {
    let shutdown = get_shutdown_token();

    if state.config.watchdog.enabled {
        services::watchdog::spawn(state.clone(), shutdown.clone());
    } else {
        info!("Watchdog disabled");
    }
    spawn_cleanup(state.clone(), shutdown.clone());

    let port = port_override.unwrap_or(state.config.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, version = config::env::constants::VERSION, "n8n-host-agent listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Server has shut down gracefully");
    Ok(())
}

/// 定期清理过期的任务历史与日志通道
fn spawn_cleanup(state: Arc<AppState>, shutdown: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    state.task_store.cleanup_stale().await;
                    state.log_hub.cleanup(24).await;
                }
            }
        }
    });
}
