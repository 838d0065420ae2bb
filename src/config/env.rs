//! 环境变量配置加载

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::domain::health::{AcceptedStatuses, ProbeSettings};
use crate::domain::supervisor::SupervisorKind;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 修复状态回调 URL（可选）
    pub callback_url: Option<String>,
    /// agent 监听端口
    pub port: u16,
    pub n8n: N8nConfig,
    pub supervisor: SupervisorConfig,
    pub backup: BackupConfig,
    pub cron: CronConfig,
    pub watchdog: WatchdogConfig,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let api_key = load_with_fallback("N8N_AGENT_API_KEY", "API_KEY").unwrap_or_else(|| {
            warn!("N8N_AGENT_API_KEY not set, using the insecure default key");
            "change-me-in-production".to_string()
        });

        let callback_url = env::var("N8N_AGENT_CALLBACK_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string());

        Self {
            api_key,
            callback_url,
            port: parse_or("N8N_AGENT_PORT", 9877),
            n8n: N8nConfig::from_env(),
            supervisor: SupervisorConfig::from_env(),
            backup: BackupConfig::from_env(),
            cron: CronConfig::from_env(),
            watchdog: WatchdogConfig::from_env(),
        }
    }
}

/// n8n 探测配置
#[derive(Clone, Debug)]
pub struct N8nConfig {
    /// 本机地址
    pub local_url: String,
    /// 公网域名地址（可选，经 nginx / Cloudflare）
    pub public_url: Option<String>,
    pub accepted: AcceptedStatuses,
    pub probe_attempts: u32,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl N8nConfig {
    pub fn from_env() -> Self {
        let accepted = env::var("N8N_ACCEPTED_STATUSES")
            .map(|v| AcceptedStatuses::parse(&v))
            .unwrap_or_default();

        Self {
            local_url: env::var("N8N_LOCAL_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5678".to_string()),
            public_url: env::var("N8N_PUBLIC_URL").ok().filter(|s| !s.is_empty()),
            accepted,
            probe_attempts: parse_or("N8N_PROBE_ATTEMPTS", 30u32).max(1),
            probe_interval_secs: parse_or("N8N_PROBE_INTERVAL_SECS", 2),
            probe_timeout_secs: parse_or("N8N_PROBE_TIMEOUT_SECS", 5),
        }
    }

    /// 本机探测参数
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            url: self.local_url.clone(),
            max_attempts: self.probe_attempts,
            interval: Duration::from_secs(self.probe_interval_secs),
            request_timeout: Duration::from_secs(self.probe_timeout_secs),
            accepted: self.accepted.clone(),
        }
    }
}

/// 进程管理器配置
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// 回退顺序
    pub order: Vec<SupervisorKind>,
    /// systemd 单元名 / pm2 应用名
    pub service_name: String,
    /// PM2 ecosystem 文件
    pub pm2_ecosystem: PathBuf,
    /// Docker 容器名
    pub docker_container: String,
    /// docker compose 文件（配置后用 compose up 代替 docker restart）
    pub compose_file: Option<PathBuf>,
    /// 单个管理命令超时
    pub command_timeout_secs: u64,
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        let order = env::var("N8N_SUPERVISORS")
            .map(|v| SupervisorKind::parse_order(&v))
            .ok()
            .filter(|order| !order.is_empty())
            .unwrap_or_else(SupervisorKind::default_order);

        Self {
            order,
            service_name: env::var("N8N_SERVICE_NAME").unwrap_or_else(|_| "n8n".to_string()),
            pm2_ecosystem: env::var("N8N_PM2_ECOSYSTEM")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/root/n8n-ecosystem.json")),
            docker_container: env::var("N8N_DOCKER_CONTAINER")
                .unwrap_or_else(|_| "n8n".to_string()),
            compose_file: env::var("N8N_COMPOSE_FILE")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            command_timeout_secs: parse_or("N8N_SUPERVISOR_TIMEOUT_SECS", 60),
        }
    }
}

/// 备份配置
#[derive(Clone, Debug)]
pub struct BackupConfig {
    /// n8n 数据目录（必须存在）
    pub data_dir: PathBuf,
    /// 额外打包的文件（不存在时跳过）
    pub extra_paths: Vec<PathBuf>,
    /// 备份输出目录
    pub backup_dir: PathBuf,
    /// 归档文件名前缀
    pub prefix: String,
    /// 保留最近的归档数量
    pub keep: usize,
    pub github: Option<GithubConfig>,
}

impl BackupConfig {
    pub fn from_env() -> Self {
        let extra_paths = env::var("N8N_BACKUP_EXTRA_PATHS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            data_dir: env::var("N8N_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/root/.n8n")),
            extra_paths,
            backup_dir: env::var("N8N_BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/root/n8n_backups")),
            prefix: env::var("N8N_BACKUP_PREFIX").unwrap_or_else(|_| "n8n_backup_".to_string()),
            keep: parse_or("N8N_BACKUP_KEEP", 7),
            github: GithubConfig::from_env(),
        }
    }

    /// 匹配本 agent 生成的归档的通配模式
    pub fn archive_pattern(&self) -> String {
        format!("{}*.tar.gz", self.prefix)
    }
}

/// GitHub 远程备份配置
#[derive(Clone, Debug)]
pub struct GithubConfig {
    /// owner/repo
    pub repo: String,
    pub token: String,
    pub branch: String,
    /// 仓库内的目录
    pub path: String,
    pub api_url: String,
}

impl GithubConfig {
    /// 仓库与 token 都配置时才启用
    pub fn from_env() -> Option<Self> {
        let repo = env::var("GITHUB_BACKUP_REPO").ok().filter(|s| !s.is_empty())?;
        let token = env::var("GITHUB_BACKUP_TOKEN").ok().filter(|s| !s.is_empty())?;

        Some(Self {
            repo,
            token,
            branch: env::var("GITHUB_BACKUP_BRANCH").unwrap_or_else(|_| "main".to_string()),
            path: env::var("GITHUB_BACKUP_PATH")
                .unwrap_or_else(|_| "backups".to_string())
                .trim_matches('/')
                .to_string(),
            api_url: env::var("GITHUB_API_URL")
                .unwrap_or_else(|_| "https://api.github.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

/// crontab 配置
#[derive(Clone, Debug)]
pub struct CronConfig {
    pub backup_schedule: String,
    pub health_schedule: String,
    /// 写入 crontab 的 agent 可执行文件路径
    pub agent_bin: String,
    /// 同步时要清理的遗留脚本关键字
    pub stale_patterns: Vec<String>,
}

impl CronConfig {
    pub fn from_env() -> Self {
        let agent_bin = env::var("N8N_AGENT_BIN").ok().unwrap_or_else(|| {
            env::current_exe()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_else(|_| "/usr/local/bin/n8n-host-agent".to_string())
        });

        let stale_patterns = env::var("N8N_CRON_STALE_PATTERNS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec!["fix_".to_string(), "n8n_fix".to_string(), "emergency".to_string()]);

        Self {
            backup_schedule: env::var("N8N_CRON_BACKUP_SCHEDULE")
                .unwrap_or_else(|_| "0 3 * * *".to_string()),
            health_schedule: env::var("N8N_CRON_HEALTH_SCHEDULE")
                .unwrap_or_else(|_| "*/5 * * * *".to_string()),
            agent_bin,
            stale_patterns,
        }
    }
}

/// 看门狗配置
#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// 连续失败多少次后触发修复
    pub failure_threshold: u32,
}

impl WatchdogConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: parse_bool("N8N_WATCHDOG_ENABLED", false),
            interval_secs: parse_or("N8N_WATCHDOG_INTERVAL_SECS", 60u64).max(1),
            failure_threshold: parse_or("N8N_WATCHDOG_FAILURE_THRESHOLD", 3u32).max(1),
        }
    }
}

/// 加载环境变量，支持 fallback
fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 常量
pub mod constants {
    /// 单次修复的总超时（秒）
    pub const REPAIR_TIMEOUT_SECS: u64 = 900; // 15 分钟

    /// 任务历史最大保存数量
    pub const MAX_TASK_HISTORY: usize = 100;

    /// 回调通知重试次数
    pub const NOTIFY_ATTEMPTS: u32 = 3;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_with_fallback() {
        env::set_var("TEST_N8N_PRIMARY", "primary_value");
        env::set_var("TEST_N8N_FALLBACK", "fallback_value");

        assert_eq!(
            load_with_fallback("TEST_N8N_PRIMARY", "TEST_N8N_FALLBACK"),
            Some("primary_value".to_string())
        );

        env::remove_var("TEST_N8N_PRIMARY");
        assert_eq!(
            load_with_fallback("TEST_N8N_PRIMARY", "TEST_N8N_FALLBACK"),
            Some("fallback_value".to_string())
        );

        env::remove_var("TEST_N8N_FALLBACK");
        assert_eq!(load_with_fallback("TEST_N8N_PRIMARY", "TEST_N8N_FALLBACK"), None);
    }

    #[test]
    fn test_parse_or_ignores_garbage() {
        env::set_var("TEST_N8N_NUMBER", "not-a-number");
        assert_eq!(parse_or("TEST_N8N_NUMBER", 42u32), 42);
        env::set_var("TEST_N8N_NUMBER", " 7 ");
        assert_eq!(parse_or("TEST_N8N_NUMBER", 42u32), 7);
        env::remove_var("TEST_N8N_NUMBER");
    }

    #[test]
    fn test_archive_pattern() {
        let config = BackupConfig {
            data_dir: PathBuf::from("/root/.n8n"),
            extra_paths: Vec::new(),
            backup_dir: PathBuf::from("/root/n8n_backups"),
            prefix: "n8n_backup_".to_string(),
            keep: 7,
            github: None,
        };
        assert_eq!(config.archive_pattern(), "n8n_backup_*.tar.gz");
    }
}
