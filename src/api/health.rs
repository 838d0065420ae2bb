//! 健康检查和主机状态 API
//!
//! 包含 /health, /status 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::VERSION;
use crate::domain::backup::BackupEntry;
use crate::domain::health::ProbeReport;
use crate::domain::supervisor::SupervisorStatus;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    running_repair: Option<String>,
    watchdog_enabled: bool,
}

/// n8n 主机状态
#[derive(Debug, Serialize)]
pub struct HostStatus {
    pub n8n: ProbeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<ProbeReport>,
    pub supervisors: Vec<SupervisorStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_backup: Option<BackupEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_repair: Option<String>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(host_status_handler))
}

/// 健康检查 - agent 自身的存活状态
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "n8n-host-agent",
        version: VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        running_repair: state.running_repair_id().await,
        watchdog_enabled: state.config.watchdog.enabled,
    })
}

/// 主机状态 - n8n 单次探测 + 进程管理器状态 + 最近备份
///
/// GET /status
/// 需要 API Key
async fn host_status_handler(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(host_status(&state).await)
}

/// 汇总主机状态（HTTP 与 CLI 共用）
pub async fn host_status(state: &AppState) -> HostStatus {
    let settings = state.config.n8n.probe_settings().single_attempt();
    let cancel = CancellationToken::new();

    let n8n = state.probe.wait_until_healthy(&settings, &cancel).await;
    let public = match state.config.n8n.public_url {
        Some(ref url) => Some(
            state
                .probe
                .wait_until_healthy(&settings.with_url(url.as_str()), &cancel)
                .await,
        ),
        None => None,
    };

    let latest_backup = match state.backups.latest().await {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list backups");
            None
        }
    };

    HostStatus {
        n8n,
        public,
        supervisors: state.supervisors.status_all().await,
        latest_backup,
        running_repair: state.running_repair_id().await,
    }
}
