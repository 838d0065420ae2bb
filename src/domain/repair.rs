//! 修复任务相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::supervisor::SupervisorKind;

/// 修复任务状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Running,
    Success,
    Failed,
}

impl RepairStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStatus::Running => "running",
            RepairStatus::Success => "success",
            RepairStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RepairStatus::Success | RepairStatus::Failed)
    }
}

/// 阶段状态
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// 修复阶段信息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepairStage {
    /// 阶段标识 (e.g., "probe", "restart", "verify")
    pub name: String,
    /// 显示名称
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    /// 附加信息
    pub message: Option<String>,
}

impl RepairStage {
    /// 创建新的待执行阶段
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    /// 开始执行阶段
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    /// 完成阶段
    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    /// 跳过阶段
    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// 修复由谁触发
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairTrigger {
    /// CLI 手动执行
    Manual,
    /// HTTP API 触发
    Api,
    /// 看门狗在连续探测失败后触发
    Watchdog,
}

/// 修复选项
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepairOptions {
    /// 即使 n8n 已健康也强制重启
    #[serde(default)]
    pub force: bool,
    /// 重启前先做一次备份
    #[serde(default = "default_backup_first")]
    pub backup_first: bool,
}

fn default_backup_first() -> bool {
    true
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            force: false,
            backup_first: true,
        }
    }
}

/// 修复任务信息
#[derive(Clone, Debug, Serialize)]
pub struct RepairTask {
    pub id: String,
    pub trigger: RepairTrigger,
    pub status: RepairStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// 最终成功拉起 n8n 的进程管理器
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorKind>,
    #[serde(default)]
    pub stages: Vec<RepairStage>,
}

impl RepairTask {
    /// 创建新任务
    pub fn new(id: String, trigger: RepairTrigger) -> Self {
        Self {
            id,
            trigger,
            status: RepairStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            supervisor: None,
            stages: Vec::new(),
        }
    }

    /// 设置任务完成
    pub fn complete(&mut self, status: RepairStatus, exit_code: Option<i32>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.exit_code = exit_code;
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_status_is_terminal() {
        assert!(!RepairStatus::Running.is_terminal());
        assert!(RepairStatus::Success.is_terminal());
        assert!(RepairStatus::Failed.is_terminal());
        assert_eq!(RepairStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_repair_stage_lifecycle() {
        let mut stage = RepairStage::new("verify", "Verify");
        assert_eq!(stage.status, StageStatus::Pending);

        stage.start();
        assert_eq!(stage.status, StageStatus::Running);

        stage.finish(false, Some("n8n never answered".to_string()));
        assert_eq!(stage.status, StageStatus::Failed);
        assert!(stage.duration_ms.is_some());
        assert_eq!(stage.message.as_deref(), Some("n8n never answered"));
    }

    #[test]
    fn test_repair_options_defaults_from_empty_json() {
        let options: RepairOptions = serde_json::from_str("{}").unwrap();
        assert!(!options.force);
        assert!(options.backup_first);
    }

    #[test]
    fn test_task_complete() {
        let mut task = RepairTask::new("t-1".to_string(), RepairTrigger::Watchdog);
        task.complete(RepairStatus::Success, Some(0));
        assert!(task.finished_at.is_some());
        assert_eq!(task.exit_code, Some(0));
    }
}
