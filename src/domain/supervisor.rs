//! 进程管理器领域模型

use serde::{Deserialize, Serialize};
use std::fmt;

/// 能托管 n8n 进程的进程管理器
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorKind {
    Systemd,
    Pm2,
    Docker,
}

impl SupervisorKind {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorKind::Systemd => "systemd",
            SupervisorKind::Pm2 => "pm2",
            SupervisorKind::Docker => "docker",
        }
    }

    /// 从字符串解析，未知值返回 None
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "systemd" | "systemctl" => Some(SupervisorKind::Systemd),
            "pm2" => Some(SupervisorKind::Pm2),
            "docker" | "docker-compose" | "docker_compose" => Some(SupervisorKind::Docker),
            _ => None,
        }
    }

    /// 解析逗号分隔的回退顺序，去重并保持首次出现的位置
    pub fn parse_order(value: &str) -> Vec<Self> {
        let mut order = Vec::new();
        for kind in value.split(',').filter_map(Self::parse) {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        order
    }

    /// 默认回退顺序
    pub fn default_order() -> Vec<Self> {
        vec![
            SupervisorKind::Systemd,
            SupervisorKind::Pm2,
            SupervisorKind::Docker,
        ]
    }
}

impl fmt::Display for SupervisorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 服务运行状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
    Unknown,
}

impl ServiceState {
    /// 映射 `systemctl is-active` 的输出
    pub fn from_systemctl(output: &str) -> Self {
        match output.trim() {
            "active" | "reloading" | "activating" => ServiceState::Active,
            "inactive" | "deactivating" => ServiceState::Inactive,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Unknown,
        }
    }

    /// 映射 pm2 进程的 `pm2_env.status`，其余状态都算未运行
    pub fn from_pm2(status: &str) -> Self {
        match status {
            "online" | "launching" => ServiceState::Active,
            "errored" => ServiceState::Failed,
            _ => ServiceState::Inactive,
        }
    }

    /// 映射 `docker inspect -f {{.State.Status}}` 的输出
    pub fn from_docker(status: &str) -> Self {
        match status.trim() {
            "running" | "restarting" => ServiceState::Active,
            "dead" => ServiceState::Failed,
            "exited" | "created" | "paused" | "removing" => ServiceState::Inactive,
            _ => ServiceState::Unknown,
        }
    }
}

/// 单个进程管理器的状态
#[derive(Clone, Debug, Serialize)]
pub struct SupervisorStatus {
    pub kind: SupervisorKind,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
