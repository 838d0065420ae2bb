//! 健康探测领域模型
//!
//! 对应运维脚本里反复出现的 `curl -w "%{http_code}"` 轮询

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// 默认视为"服务已启动"的状态码：200 正常，401 开启了 basic auth，302 跳转登录页
pub const DEFAULT_ACCEPTED: [u16; 3] = [200, 302, 401];

/// 可接受的 HTTP 状态码集合
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AcceptedStatuses(BTreeSet<u16>);

impl AcceptedStatuses {
    /// 从逗号分隔的列表解析，无效项被忽略，结果为空时回退到默认值
    pub fn parse(value: &str) -> Self {
        let set: BTreeSet<u16> = value
            .split(',')
            .filter_map(|s| s.trim().parse::<u16>().ok())
            .filter(|code| (100..600).contains(code))
            .collect();

        if set.is_empty() {
            Self::default()
        } else {
            Self(set)
        }
    }

    pub fn contains(&self, status: u16) -> bool {
        self.0.contains(&status)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }
}

impl Default for AcceptedStatuses {
    fn default() -> Self {
        Self(DEFAULT_ACCEPTED.into_iter().collect())
    }
}

/// 探测参数
#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub url: String,
    /// 最大尝试次数（至少 1 次）
    pub max_attempts: u32,
    /// 两次尝试之间的等待
    pub interval: Duration,
    /// 单次请求超时
    pub request_timeout: Duration,
    pub accepted: AcceptedStatuses,
}

impl ProbeSettings {
    /// 只探测一次的副本
    pub fn single_attempt(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }

    /// 替换探测地址
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

/// 单次探测结果
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeOutcome {
    /// 返回了可接受的状态码
    Up(u16),
    /// 返回了状态码但不在可接受集合中
    Unexpected(u16),
    /// 连接失败或超时
    Unreachable(String),
}

impl ProbeOutcome {
    /// 根据状态码和可接受集合分类
    pub fn classify(status: u16, accepted: &AcceptedStatuses) -> Self {
        if accepted.contains(status) {
            ProbeOutcome::Up(status)
        } else {
            ProbeOutcome::Unexpected(status)
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, ProbeOutcome::Up(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProbeOutcome::Up(s) | ProbeOutcome::Unexpected(s) => Some(*s),
            ProbeOutcome::Unreachable(_) => None,
        }
    }
}

/// 探测报告
#[derive(Clone, Debug, Serialize)]
pub struct ProbeReport {
    pub url: String,
    pub healthy: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub elapsed_ms: u64,
    pub checked_at: DateTime<Utc>,
}

impl ProbeReport {
    /// 人类可读的单行摘要
    pub fn summary(&self) -> String {
        let code = self
            .last_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "000".to_string());
        if self.healthy {
            format!(
                "{} is UP (HTTP {}) after {} attempt(s)",
                self.url, code, self.attempts
            )
        } else {
            let reason = self.last_error.as_deref().unwrap_or("unexpected status");
            format!(
                "{} is DOWN (HTTP {}, {}) after {} attempt(s)",
                self.url, code, reason, self.attempts
            )
        }
    }
}
