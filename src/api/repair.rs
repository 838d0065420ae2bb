//! 修复管理 API
//!
//! 包含 /repair, /tasks/*, /logs/* 端点

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::repair::{LogLine, RepairOptions, RepairTask, RepairTrigger};
use crate::error::{ApiError, ApiResult};
use crate::middleware::RequireApiKey;
use crate::services::repair;
use crate::state::AppState;

/// 触发修复响应
#[derive(Debug, Serialize)]
pub struct RepairResponse {
    pub task_id: String,
    pub status: String,
    pub stream_url: String,
}

/// 任务查询参数
#[derive(Debug, Deserialize)]
pub struct RecentTasksQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 状态过滤 (running, success, failed)
    pub status: Option<String>,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct RecentTasksResponse {
    pub tasks: Vec<RepairTask>,
    pub total: usize,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/repair", post(trigger_repair))
        .route("/tasks/recent", get(recent_tasks))
        .route("/tasks/:task_id", get(get_task))
        .route("/tasks/:task_id/cancel", post(cancel_task))
        .route("/logs/:task_id/stream", get(stream_logs))
}

/// 触发修复
///
/// POST /repair
/// 需要 API Key；已有修复在运行时返回 409
async fn trigger_repair(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<RepairOptions>>,
) -> ApiResult<impl IntoResponse> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    let task_id = repair::start(state, RepairTrigger::Api, options).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RepairResponse {
            stream_url: format!("/logs/{}/stream", task_id),
            task_id,
            status: "running".to_string(),
        }),
    ))
}

/// GET /tasks/:task_id
async fn get_task(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<RepairTask>> {
    state
        .task_store
        .get_any(&task_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Task '{}'", task_id)))
}

/// GET /tasks/recent?limit=&status=
async fn recent_tasks(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentTasksQuery>,
) -> impl IntoResponse {
    let tasks = state
        .task_store
        .recent(query.limit, query.status.as_deref())
        .await;
    let total = tasks.len();
    Json(RecentTasksResponse { tasks, total })
}

/// POST /tasks/:task_id/cancel
async fn cancel_task(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.cancel_repair(&task_id).await {
        return Err(ApiError::not_found(format!("Running task '{}'", task_id)));
    }
    tracing::info!(task_id = %task_id, "Repair cancellation requested");
    Ok(Json(serde_json::json!({ "task_id": task_id, "cancelled": true })))
}

/// 流式日志
///
/// GET /logs/:task_id/stream
/// 无需认证；任务结束后发送 `complete` 事件并关闭
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut rx = state
        .log_hub
        .subscribe(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Log stream for task '{}'", task_id)))?;

    enum Next {
        Line(LogLine),
        Idle,
        Finished,
    }

    let stream = async_stream::stream! {
        let mut poll = tokio::time::interval(Duration::from_millis(500));
        loop {
            let next = tokio::select! {
                received = rx.recv() => match received {
                    Ok(line) => Next::Line(line),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(task_id = %task_id, lagged = n, "Log subscriber lagged");
                        Next::Idle
                    }
                    Err(broadcast::error::RecvError::Closed) => Next::Finished,
                },
                _ = poll.tick() => {
                    if state.log_hub.is_finished(&task_id).await {
                        Next::Finished
                    } else {
                        Next::Idle
                    }
                }
            };

            match next {
                Next::Line(line) => {
                    let json = serde_json::to_string(&line).unwrap_or_default();
                    yield Ok(Event::default().data(json));
                }
                Next::Idle => {}
                Next::Finished => {
                    // 先发完缓冲中的日志
                    while let Ok(line) = rx.try_recv() {
                        let json = serde_json::to_string(&line).unwrap_or_default();
                        yield Ok(Event::default().data(json));
                    }
                    if let Some(task) = state.task_store.get_any(&task_id).await {
                        yield Ok(Event::default().event("complete").data(
                            serde_json::json!({
                                "status": task.status.as_str(),
                                "exit_code": task.exit_code,
                            })
                            .to_string(),
                        ));
                    }
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
