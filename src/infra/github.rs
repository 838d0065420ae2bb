//! GitHub 远程备份
//!
//! 通过 contents API 上传归档：先查询已有文件的 sha，再 PUT base64 内容

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::env::constants::VERSION;
use crate::config::GithubConfig;

/// 上传错误
#[derive(Debug, Error)]
pub enum GithubError {
    #[error("failed to read archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("GitHub request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("GitHub returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// 上传结果
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub repo: String,
    pub path: String,
    pub branch: String,
    /// 是否覆盖了已有文件
    pub updated: bool,
}

#[derive(Deserialize)]
struct ContentInfo {
    sha: String,
}

#[derive(Serialize)]
struct PutContent<'a> {
    message: String,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

/// GitHub contents API 客户端
#[derive(Clone)]
pub struct GithubUploader {
    client: Client,
    config: GithubConfig,
    retry_delay: Duration,
}

impl GithubUploader {
    pub fn new(config: GithubConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(format!("n8n-host-agent/{}", VERSION))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            config,
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// 仓库内的目标路径
    pub fn remote_path(&self, file_name: &str) -> String {
        if self.config.path.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.config.path, file_name)
        }
    }

    fn contents_url(&self, remote_path: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.config.api_url, self.config.repo, remote_path
        )
    }

    /// 上传归档，失败重试 3 次
    pub async fn upload(&self, archive: &Path) -> Result<UploadResult, GithubError> {
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "backup.tar.gz".to_string());
        let bytes = tokio::fs::read(archive).await?;
        let encoded = STANDARD.encode(&bytes);
        let remote_path = self.remote_path(&file_name);

        let mut last_error = None;
        for attempt in 1..=3 {
            match self.try_upload(&remote_path, &file_name, &encoded).await {
                Ok(result) => {
                    info!(
                        repo = %self.config.repo,
                        path = %remote_path,
                        size = bytes.len(),
                        attempt = attempt,
                        "Backup pushed to GitHub"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!(
                        repo = %self.config.repo,
                        error = %e,
                        attempt = attempt,
                        "GitHub upload failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < 3 {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or(GithubError::Api {
            status: 0,
            body: "no attempt made".to_string(),
        }))
    }

    async fn try_upload(
        &self,
        remote_path: &str,
        file_name: &str,
        encoded: &str,
    ) -> Result<UploadResult, GithubError> {
        let url = self.contents_url(remote_path);
        let existing_sha = self.lookup_sha(&url).await?;
        let updated = existing_sha.is_some();

        let body = PutContent {
            message: format!("n8n backup {}", file_name),
            content: encoded.to_string(),
            branch: &self.config.branch,
            sha: existing_sha,
        };

        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(UploadResult {
                repo: self.config.repo.clone(),
                path: remote_path.to_string(),
                branch: self.config.branch.clone(),
                updated,
            })
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(GithubError::Api { status, body })
        }
    }

    /// 查询已有文件的 sha，不存在时返回 None
    async fn lookup_sha(&self, url: &str) -> Result<Option<String>, GithubError> {
        let resp = self
            .client
            .get(url)
            .query(&[("ref", self.config.branch.as_str())])
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json::<ContentInfo>().await?.sha)),
            s => Err(GithubError::Api {
                status: s.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: &str) -> GithubConfig {
        GithubConfig {
            repo: "ops/n8n-backups".to_string(),
            token: "t".to_string(),
            branch: "main".to_string(),
            path: path.to_string(),
            api_url: "https://api.github.com".to_string(),
        }
    }

    #[test]
    fn test_remote_path() {
        let uploader = GithubUploader::new(config("backups"));
        assert_eq!(uploader.remote_path("a.tar.gz"), "backups/a.tar.gz");
        assert_eq!(
            uploader.contents_url("backups/a.tar.gz"),
            "https://api.github.com/repos/ops/n8n-backups/contents/backups/a.tar.gz"
        );

        let uploader = GithubUploader::new(config(""));
        assert_eq!(uploader.remote_path("a.tar.gz"), "a.tar.gz");
    }

    #[tokio::test]
    async fn test_upload_retries_and_updates_existing() {
        use axum::{http::StatusCode as Status, routing::get, Json, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let puts = Arc::new(AtomicUsize::new(0));
        let counter = puts.clone();
        let app = Router::new().route(
            "/repos/ops/n8n-backups/contents/backups/a.tar.gz",
            get(|| async { Json(serde_json::json!({ "sha": "abc123" })) }).put(
                move |Json(body): Json<serde_json::Value>| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        assert_eq!(body["sha"], "abc123");
                        assert_eq!(body["branch"], "main");
                        if n == 0 {
                            Status::INTERNAL_SERVER_ERROR
                        } else {
                            Status::OK
                        }
                    }
                },
            ),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar.gz");
        std::fs::write(&archive, b"archive").unwrap();

        let mut cfg = config("backups");
        cfg.api_url = format!("http://{}", addr);
        let uploader = GithubUploader::new(cfg).with_retry_delay(Duration::from_millis(1));

        let result = uploader.upload(&archive).await.unwrap();
        assert!(result.updated);
        assert_eq!(result.path, "backups/a.tar.gz");
        assert_eq!(puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_upload_missing_file() {
        let uploader = GithubUploader::new(config("backups"));
        let result = uploader.upload(Path::new("/nonexistent/archive.tar.gz")).await;
        assert!(matches!(result, Err(GithubError::Io(_))));
    }
}
