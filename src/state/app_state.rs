//! 应用状态

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 全局 shutdown token，用于优雅关闭所有后台任务
static GLOBAL_SHUTDOWN: std::sync::OnceLock<CancellationToken> = std::sync::OnceLock::new();

/// 获取全局 shutdown token
pub fn get_shutdown_token() -> CancellationToken {
    GLOBAL_SHUTDOWN.get_or_init(CancellationToken::new).clone()
}

/// 触发全局 shutdown
pub fn trigger_shutdown() {
    if let Some(token) = GLOBAL_SHUTDOWN.get() {
        token.cancel();
    }
}

use crate::config::env::EnvConfig;
use crate::infra::{CommandExec, CommandRunner, HttpProbe, WebhookNotifier};
use crate::services::{backup::BackupManager, cron::CrontabManager, supervisor::SupervisorChain};

use super::log_hub::LogHub;
use super::task_store::TaskStore;

/// 运行中的修复
pub struct RunningRepair {
    pub task_id: String,
    pub cancel_token: CancellationToken,
}

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// API 密钥（用于验证请求）
    pub api_key: String,
    pub config: EnvConfig,
    pub started_at: DateTime<Utc>,

    // ========== 任务管理 ==========
    pub task_store: TaskStore,
    pub log_hub: LogHub,
    /// 同一时间最多一个修复
    pub running_repair: RwLock<Option<RunningRepair>>,

    // ========== 主机操作 ==========
    pub probe: HttpProbe,
    pub supervisors: SupervisorChain,
    pub backups: BackupManager,
    pub crontab: CrontabManager,

    // ========== 外部服务 ==========
    pub notifier: WebhookNotifier,
}

impl AppState {
    /// 使用真实命令执行器创建
    pub fn new(config: EnvConfig) -> Self {
        Self::with_exec(config, Arc::new(CommandRunner))
    }

    /// 指定命令执行器（测试中注入假的执行器）
    pub fn with_exec(config: EnvConfig, exec: Arc<dyn CommandExec>) -> Self {
        tracing::info!(
            api_key_len = config.api_key.len(),
            callback_url = ?config.callback_url,
            port = config.port,
            n8n_url = %config.n8n.local_url,
            supervisors = ?config.supervisor.order,
            backup_dir = %config.backup.backup_dir.display(),
            github_backup = config.backup.github.is_some(),
            watchdog = config.watchdog.enabled,
            "Loaded configuration"
        );

        Self {
            api_key: config.api_key.clone(),
            started_at: Utc::now(),

            task_store: TaskStore::new(),
            log_hub: LogHub::new(),
            running_repair: RwLock::new(None),

            probe: HttpProbe::new(),
            supervisors: SupervisorChain::new(exec.clone(), config.supervisor.clone()),
            backups: BackupManager::new(exec.clone(), config.backup.clone()),
            crontab: CrontabManager::new(exec, config.cron.clone()),

            notifier: WebhookNotifier::new(config.callback_url.clone()),

            config,
        }
    }

    /// 注册修复；已有修复在运行时返回其任务 ID
    ///
    /// 取消令牌是全局 shutdown token 的子令牌，进程退出时修复一并取消
    pub async fn try_register_repair(&self, task_id: &str) -> Result<CancellationToken, String> {
        let mut running = self.running_repair.write().await;
        if let Some(ref current) = *running {
            return Err(current.task_id.clone());
        }

        let cancel_token = get_shutdown_token().child_token();
        *running = Some(RunningRepair {
            task_id: task_id.to_string(),
            cancel_token: cancel_token.clone(),
        });
        Ok(cancel_token)
    }

    /// 取消注册，只移除同一个任务
    pub async fn unregister_repair(&self, task_id: &str) {
        let mut running = self.running_repair.write().await;
        if running.as_ref().is_some_and(|r| r.task_id == task_id) {
            *running = None;
        }
    }

    pub async fn running_repair_id(&self) -> Option<String> {
        self.running_repair
            .read()
            .await
            .as_ref()
            .map(|r| r.task_id.clone())
    }

    /// 取消指定修复，返回是否找到
    pub async fn cancel_repair(&self, task_id: &str) -> bool {
        match *self.running_repair.read().await {
            Some(ref r) if r.task_id == task_id => {
                r.cancel_token.cancel();
                true
            }
            _ => false,
        }
    }

    /// 运行时长（秒）
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
