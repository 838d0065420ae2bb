//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod backups;
pub mod cron;
pub mod health;
pub mod repair;
pub mod system;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Repair / tasks / logs
        .merge(repair::router())
        // Backups
        .merge(backups::router())
        // Crontab
        .merge(cron::router())
        // System
        .merge(system::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
