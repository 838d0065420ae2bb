//! 统一错误处理
//!
//! `ApiError` 实现 `IntoResponse`，服务层错误通过 `From` 映射到 HTTP 状态码

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::services::backup::BackupError;
use crate::services::cron::CronError;
use crate::services::repair::RepairError;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug, Error)]
pub enum ApiError {
    /// 401 - API Key 无效或缺失
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// 409 - 已有修复在运行，附带运行中的任务 ID
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        task_id: Option<String>,
    },
    #[error("Internal error: {0}")]
    Internal(String),
    /// 502 - 主机上的外部工具失败（tar、crontab、GitHub）
    #[error("Upstream failure: {0}")]
    Upstream(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<RepairError> for ApiError {
    fn from(e: RepairError) -> Self {
        match e {
            RepairError::AlreadyRunning { ref task_id } => ApiError::Conflict {
                message: e.to_string(),
                task_id: Some(task_id.clone()),
            },
        }
    }
}

impl From<BackupError> for ApiError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::MissingDataDir(_) | BackupError::GithubNotConfigured => {
                ApiError::BadRequest(e.to_string())
            }
            BackupError::Pattern(_) | BackupError::Io { .. } => ApiError::Internal(e.to_string()),
            _ => ApiError::Upstream(e.to_string()),
        }
    }
}

impl From<CronError> for ApiError {
    fn from(e: CronError) -> Self {
        match e {
            CronError::Job(_) => ApiError::BadRequest(e.to_string()),
            _ => ApiError::Upstream(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            ApiError::Unauthorized => {
                ErrorResponse::new("unauthorized", "Invalid or missing API key")
            }
            ApiError::NotFound(resource) => {
                ErrorResponse::new("not_found", format!("{} not found", resource))
            }
            ApiError::BadRequest(msg) => ErrorResponse::new("bad_request", msg),
            ApiError::Conflict { message, task_id } => {
                let body = ErrorResponse::new("conflict", message);
                match task_id {
                    Some(id) => body.with_details(id),
                    None => body,
                }
            }
            ApiError::Internal(msg) => ErrorResponse::new("internal_error", msg),
            ApiError::Upstream(msg) => ErrorResponse::new("upstream_failure", msg),
        };

        (status, Json(body)).into_response()
    }
}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
