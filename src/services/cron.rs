//! crontab 管理
//!
//! 读取 → 清理遗留脚本条目 → 去重 → 写入受管任务 → 有改动才写回

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::CronConfig;
use crate::domain::cron::{CronParseError, CronTable, ManagedJob};
use crate::infra::command::{CommandError, CommandExec, CommandSpec};

/// 受管任务名称
pub const BACKUP_JOB: &str = "backup";
pub const HEALTH_JOB: &str = "health";

/// crontab 操作错误
#[derive(Debug, Error)]
pub enum CronError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("crontab failed: {0}")]
    Crontab(String),
    #[error("invalid managed job: {0}")]
    Job(#[from] CronParseError),
}

/// 同步结果
#[derive(Debug, Clone, Serialize)]
pub struct CronSyncReport {
    pub stale_removed: usize,
    pub duplicates_removed: usize,
    /// 新增或被替换的受管任务
    pub updated_jobs: Vec<String>,
    pub changed: bool,
    pub managed: Vec<ManagedJob>,
}

#[derive(Clone)]
pub struct CrontabManager {
    exec: Arc<dyn CommandExec>,
    config: CronConfig,
}

impl CrontabManager {
    pub fn new(exec: Arc<dyn CommandExec>, config: CronConfig) -> Self {
        Self { exec, config }
    }

    /// 当前用户的 crontab；没有 crontab 时返回空表
    pub async fn read(&self) -> Result<CronTable, CronError> {
        let output = self.exec.run(&CommandSpec::new("crontab", ["-l"])).await?;
        let table = if output.success() {
            CronTable::parse(&output.stdout)
        } else if output.stderr.contains("no crontab for") {
            CronTable::default()
        } else {
            return Err(CronError::Crontab(output.error_summary()));
        };
        Ok(table.owned_by(&self.config.agent_bin))
    }

    pub async fn write(&self, table: &CronTable) -> Result<(), CronError> {
        let spec = CommandSpec::new("crontab", ["-"]).stdin(table.render());
        let output = self.exec.run(&spec).await?;
        if !output.success() {
            return Err(CronError::Crontab(output.error_summary()));
        }
        Ok(())
    }

    /// agent 需要安装的任务
    pub fn desired_jobs(&self) -> Result<Vec<ManagedJob>, CronError> {
        let bin = &self.config.agent_bin;
        Ok(vec![
            ManagedJob::new(
                BACKUP_JOB,
                &self.config.backup_schedule,
                format!("{} backup create", bin),
            )?,
            ManagedJob::new(
                HEALTH_JOB,
                &self.config.health_schedule,
                format!("{bin} check --attempts 3 || {bin} repair"),
            )?,
        ])
    }

    pub async fn sync(&self) -> Result<CronSyncReport, CronError> {
        let desired = self.desired_jobs()?;
        let mut table = self.read().await?;

        let report = apply_sync(&mut table, &desired, &self.config.stale_patterns);
        if report.changed {
            self.write(&table).await?;
            info!(
                stale_removed = report.stale_removed,
                duplicates_removed = report.duplicates_removed,
                updated = ?report.updated_jobs,
                "Crontab updated"
            );
        } else {
            info!("Crontab already up to date");
        }

        Ok(report)
    }

    /// 删除受管任务，返回是否存在
    pub async fn remove(&self, name: &str) -> Result<bool, CronError> {
        let mut table = self.read().await?;
        if !table.remove(name) {
            return Ok(false);
        }
        self.write(&table).await?;
        info!(job = %name, "Removed managed cron job");
        Ok(true)
    }
}

/// 在内存中的表上执行同步步骤
fn apply_sync(table: &mut CronTable, desired: &[ManagedJob], stale_patterns: &[String]) -> CronSyncReport {
    let stale_removed: usize = stale_patterns
        .iter()
        .map(|pattern| table.remove_matching(pattern))
        .sum();
    let duplicates_removed = table.dedupe();

    let updated_jobs: Vec<String> = desired
        .iter()
        .filter(|job| table.upsert(job))
        .map(|job| job.name.clone())
        .collect();

    CronSyncReport {
        stale_removed,
        duplicates_removed,
        changed: stale_removed > 0 || duplicates_removed > 0 || !updated_jobs.is_empty(),
        updated_jobs,
        managed: table.managed_jobs(),
    }
}
