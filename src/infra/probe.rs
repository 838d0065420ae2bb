//! n8n HTTP 健康探测
//!
//! 把脚本里到处复制的轮询写法收敛为一个函数：
//! 请求 → 状态码在可接受集合内即成功 → 否则等待后重试

use reqwest::{redirect, Client};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::health::{AcceptedStatuses, ProbeOutcome, ProbeReport, ProbeSettings};

/// HTTP 探测客户端
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    /// 创建探测客户端
    ///
    /// 不跟随重定向：n8n 未登录时返回 302，必须原样看到这个状态码
    pub fn new() -> Self {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .connect_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(2)
            .build()
            .expect("Failed to create HTTP client");

        Self { client }
    }

    /// 单次探测
    pub async fn probe_once(
        &self,
        url: &str,
        accepted: &AcceptedStatuses,
        timeout: Duration,
    ) -> ProbeOutcome {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(resp) => ProbeOutcome::classify(resp.status().as_u16(), accepted),
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_connect() {
                    "connection refused".to_string()
                } else {
                    e.to_string()
                };
                ProbeOutcome::Unreachable(reason)
            }
        }
    }

    /// 轮询直到健康、次数用尽或被取消
    pub async fn wait_until_healthy(
        &self,
        settings: &ProbeSettings,
        cancel: &CancellationToken,
    ) -> ProbeReport {
        self.wait_until_healthy_with(settings, cancel, |_, _| {}).await
    }

    /// 同 `wait_until_healthy`，每次尝试后回调 `on_attempt(attempt, outcome)`
    pub async fn wait_until_healthy_with<F>(
        &self,
        settings: &ProbeSettings,
        cancel: &CancellationToken,
        mut on_attempt: F,
    ) -> ProbeReport
    where
        F: FnMut(u32, &ProbeOutcome),
    {
        let started = Instant::now();
        let max_attempts = settings.max_attempts.max(1);
        let mut attempts = 0;
        let mut last = ProbeOutcome::Unreachable("not probed".to_string());

        while attempts < max_attempts {
            attempts += 1;

            last = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(url = %settings.url, attempt = attempts, "Probe cancelled");
                    ProbeOutcome::Unreachable("cancelled".to_string())
                }
                outcome = self.probe_once(&settings.url, &settings.accepted, settings.request_timeout) => outcome,
            };
            on_attempt(attempts, &last);

            if last.is_up() || cancel.is_cancelled() {
                break;
            }

            debug!(
                url = %settings.url,
                attempt = attempts,
                max_attempts = max_attempts,
                outcome = ?last,
                "n8n not ready yet"
            );

            if attempts < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.interval) => {}
                }
            }
        }

        let healthy = last.is_up();
        let last_error = match &last {
            ProbeOutcome::Unreachable(reason) => Some(reason.clone()),
            _ => None,
        };

        if healthy {
            info!(url = %settings.url, attempts = attempts, "n8n is responding");
        } else {
            warn!(url = %settings.url, attempts = attempts, outcome = ?last, "n8n did not become healthy");
        }

        ProbeReport {
            url: settings.url.clone(),
            healthy,
            attempts,
            last_status: last.status(),
            last_error,
            elapsed_ms: started.elapsed().as_millis() as u64,
            checked_at: chrono::Utc::now(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str, attempts: u32) -> ProbeSettings {
        ProbeSettings {
            url: url.to_string(),
            max_attempts: attempts,
            interval: Duration::from_millis(10),
            request_timeout: Duration::from_millis(500),
            accepted: AcceptedStatuses::default(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_exhausts_attempts() {
        // 端口 1 上通常没有服务
        let probe = HttpProbe::new();
        let mut seen = Vec::new();
        let report = probe
            .wait_until_healthy_with(
                &settings("http://127.0.0.1:1", 3),
                &CancellationToken::new(),
                |attempt, _| seen.push(attempt),
            )
            .await;

        assert!(!report.healthy);
        assert_eq!(report.attempts, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(report.last_status.is_none());
        assert!(report.last_error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_stops_early() {
        let probe = HttpProbe::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = probe
            .wait_until_healthy(&settings("http://127.0.0.1:1", 50), &cancel)
            .await;

        assert!(!report.healthy);
        assert_eq!(report.attempts, 1);
    }
}
