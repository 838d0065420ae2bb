//! 修复状态回调客户端
//!
//! 把修复日志与最终状态推送到外部 webhook，复用连接池

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::env::constants::NOTIFY_ATTEMPTS;
use crate::domain::repair::{LogLine, RepairStage, RepairStatus};

/// 回调通知错误
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("callback returned non-success status")]
    NonSuccessStatus,
}

/// 回调客户端
///
/// 未配置回调 URL 时所有方法都是空操作
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    callback_url: Option<String>,
    retry_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(callback_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            callback_url,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// 调整重试间隔（测试中使用较短的间隔）
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback_url.is_some()
    }

    pub fn callback_url(&self) -> Option<&str> {
        self.callback_url.as_deref()
    }

    /// 追加日志行，失败静默忽略
    pub async fn append_log(&self, task_id: &str, line: &LogLine) {
        if let Some(ref url) = self.callback_url {
            let append_url = format!("{}/repairs/{}/logs", url, task_id);
            let _ = self
                .client
                .post(&append_url)
                .timeout(Duration::from_secs(5))
                .json(&serde_json::json!({
                    "line": line.content,
                    "stream": line.stream,
                    "timestamp": line.timestamp,
                }))
                .send()
                .await;
        }
    }

    /// 通知修复最终状态（带阶段信息，带重试）
    pub async fn notify_status(
        &self,
        task_id: &str,
        status: &RepairStatus,
        exit_code: i32,
        stages: &[RepairStage],
    ) -> Result<(), NotifyError> {
        let Some(ref url) = self.callback_url else {
            return Ok(());
        };

        let status_url = format!("{}/repairs/{}", url, task_id);
        let body = NotifyBody {
            status: status.as_str(),
            exit_code,
            stages,
        };

        let mut last_error = None;
        for attempt in 1..=NOTIFY_ATTEMPTS {
            match self
                .client
                .patch(&status_url)
                .timeout(Duration::from_secs(10))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        task_id = %task_id,
                        status = %status.as_str(),
                        attempt = attempt,
                        "Notified repair status"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        task_id = %task_id,
                        status = %resp.status(),
                        attempt = attempt,
                        "Callback returned non-success status"
                    );
                }
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        error = %e,
                        attempt = attempt,
                        "Failed to notify callback, will retry"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < NOTIFY_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!(
            task_id = %task_id,
            "Failed to notify callback after {} attempts", NOTIFY_ATTEMPTS
        );

        match last_error {
            Some(e) => Err(NotifyError::Network(e)),
            None => Err(NotifyError::NonSuccessStatus),
        }
    }
}

#[derive(Serialize)]
struct NotifyBody<'a> {
    status: &'a str,
    exit_code: i32,
    stages: &'a [RepairStage],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_without_callback() {
        let notifier = WebhookNotifier::new(None);
        assert!(!notifier.has_callback());
        assert!(notifier.callback_url().is_none());
    }

    #[tokio::test]
    async fn test_notify_without_callback_is_noop() {
        let notifier = WebhookNotifier::new(None);
        let result = notifier
            .notify_status("t-1", &RepairStatus::Success, 0, &[])
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_notify_unreachable_callback_fails_after_retries() {
        let notifier = WebhookNotifier::new(Some("http://127.0.0.1:1".to_string()))
            .with_retry_delay(Duration::from_millis(1));
        let result = notifier
            .notify_status("t-1", &RepairStatus::Failed, 1, &[])
            .await;
        assert!(matches!(result, Err(NotifyError::Network(_))));
    }
}
