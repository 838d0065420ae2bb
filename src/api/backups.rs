//! 备份 API
//!
//! 包含 /backups, /backups/prune 端点

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::backup::BackupEntry;
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct BackupListResponse {
    backup_dir: String,
    keep: usize,
    github_enabled: bool,
    total_bytes: u64,
    backups: Vec<BackupEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateBackupRequest {
    /// 创建后推送到 GitHub
    #[serde(default)]
    pub push: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PruneRequest {
    /// 保留数量，缺省使用配置值
    pub keep: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/backups", get(list_backups).post(create_backup))
        .route("/backups/prune", post(prune_backups))
}

/// GET /backups
async fn list_backups(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let backups = state.backups.list().await?;
    let config = state.backups.config();

    Ok(Json(BackupListResponse {
        backup_dir: config.backup_dir.display().to_string(),
        keep: config.keep,
        github_enabled: state.backups.github_enabled(),
        total_bytes: backups.iter().map(|b| b.size_bytes).sum(),
        backups,
    }))
}

/// POST /backups
async fn create_backup(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateBackupRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let created = state.backups.create(request.push).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /backups/prune
async fn prune_backups(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<PruneRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let keep = request.keep.unwrap_or(state.backups.config().keep);
    let plan = state.backups.prune(keep, request.dry_run).await?;

    Ok(Json(serde_json::json!({
        "keep": keep,
        "dry_run": request.dry_run,
        "kept": plan.keep,
        "pruned": plan.prune,
        "pruned_bytes": plan.pruned_bytes(),
    })))
}
