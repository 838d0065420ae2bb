//! crontab API
//!
//! 包含 /cron, /cron/sync 端点

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/cron", get(show_crontab))
        .route("/cron/sync", post(sync_crontab))
}

/// GET /cron
async fn show_crontab(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let table = state.crontab.read().await?;
    Ok(Json(serde_json::json!({
        "crontab": table.render(),
        "managed": table.managed_jobs(),
        "job_count": table.jobs().count(),
    })))
}

/// POST /cron/sync
async fn sync_crontab(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.crontab.sync().await?))
}
