//! 备份管理
//!
//! - 用 tar 打包 n8n 数据目录与额外文件
//! - 按保留策略清理旧归档
//! - 可选推送到 GitHub 仓库

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::config::BackupConfig;
use crate::domain::backup::{archive_name, plan_retention, sort_newest_first, BackupEntry, GlobPattern, RetentionPlan};
use crate::infra::command::{CommandError, CommandExec, CommandSpec};
use crate::infra::github::{GithubError, GithubUploader, UploadResult};

/// tar 打包超时
const TAR_TIMEOUT_SECS: u64 = 1800;

/// 备份错误
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("n8n data directory {0} does not exist")]
    MissingDataDir(PathBuf),
    #[error("invalid backup pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("tar failed: {0}")]
    Archive(String),
    #[error("GitHub backup is not configured")]
    GithubNotConfigured,
    #[error(transparent)]
    Github(#[from] GithubError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// 一次备份的结果
#[derive(Debug, Clone, Serialize)]
pub struct CreatedBackup {
    pub entry: BackupEntry,
    /// 不存在而被跳过的额外路径
    pub skipped: Vec<PathBuf>,
    /// 备份后执行的保留清理
    pub retention: RetentionPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadResult>,
}

/// 备份管理器
#[derive(Clone)]
pub struct BackupManager {
    exec: Arc<dyn CommandExec>,
    config: BackupConfig,
    github: Option<GithubUploader>,
}

impl BackupManager {
    pub fn new(exec: Arc<dyn CommandExec>, config: BackupConfig) -> Self {
        let github = config.github.clone().map(GithubUploader::new);
        Self {
            exec,
            config,
            github,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn github_enabled(&self) -> bool {
        self.github.is_some()
    }

    fn pattern(&self) -> Result<GlobPattern, BackupError> {
        Ok(GlobPattern::new(&self.config.archive_pattern())?)
    }

    /// 列出本 agent 生成的归档，最新在前
    pub async fn list(&self) -> Result<Vec<BackupEntry>, BackupError> {
        list_matching(&self.config.backup_dir, &self.pattern()?).await
    }

    /// 最新的归档
    pub async fn latest(&self) -> Result<Option<BackupEntry>, BackupError> {
        Ok(self.list().await?.into_iter().next())
    }

    /// 按保留数量清理
    pub async fn prune(&self, keep: usize, dry_run: bool) -> Result<RetentionPlan, BackupError> {
        prune_matching(&self.config.backup_dir, &self.pattern()?, keep, dry_run).await
    }

    /// 创建归档并执行保留清理，`push` 为 true 时上传到 GitHub
    pub async fn create(&self, push: bool) -> Result<CreatedBackup, BackupError> {
        let data_dir = &self.config.data_dir;
        if !fs::try_exists(data_dir).await.unwrap_or(false) {
            return Err(BackupError::MissingDataDir(data_dir.clone()));
        }

        let mut sources = vec![data_dir.clone()];
        let mut skipped = Vec::new();
        for extra in &self.config.extra_paths {
            if fs::try_exists(extra).await.unwrap_or(false) {
                sources.push(extra.clone());
            } else {
                warn!(path = %extra.display(), "Backup path does not exist, skipping");
                skipped.push(extra.clone());
            }
        }

        let backup_dir = &self.config.backup_dir;
        fs::create_dir_all(backup_dir).await.map_err(io_err(backup_dir))?;

        let archive = unused_archive_path(backup_dir, &archive_name(&self.config.prefix, Utc::now())).await;
        let spec = CommandSpec::new("tar", tar_args(&archive, &sources))
            .timeout(Duration::from_secs(TAR_TIMEOUT_SECS));

        info!(archive = %archive.display(), sources = sources.len(), "Creating backup archive");
        let output = self.exec.run(&spec).await?;
        if !output.success() {
            let _ = fs::remove_file(&archive).await;
            return Err(BackupError::Archive(output.error_summary()));
        }

        let entry = entry_for(&archive).await?;
        info!(
            archive = %entry.name,
            size_bytes = entry.size_bytes,
            "Backup archive created"
        );

        // 刚创建的归档总是保留
        let retention = self.prune(self.config.keep.max(1), false).await?;

        let upload = if push {
            Some(self.push(&entry).await?)
        } else {
            None
        };

        Ok(CreatedBackup {
            entry,
            skipped,
            retention,
            upload,
        })
    }

    /// 推送归档到 GitHub
    pub async fn push(&self, entry: &BackupEntry) -> Result<UploadResult, BackupError> {
        let uploader = self.github.as_ref().ok_or(BackupError::GithubNotConfigured)?;
        Ok(uploader.upload(&entry.path).await?)
    }
}

/// 同一秒内已有同名归档时追加 `_1`、`_2` 后缀
async fn unused_archive_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }
    let stem = name.strip_suffix(".tar.gz").unwrap_or(name);
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{}_{}.tar.gz", stem, n));
        if !fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// 构造 tar 参数：每个源路径用 `-C <父目录> <名称>`，归档内不带绝对路径
fn tar_args(archive: &Path, sources: &[PathBuf]) -> Vec<String> {
    let mut args = vec!["-czf".to_string(), archive.to_string_lossy().to_string()];
    for source in sources {
        let parent = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("/"));
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());
        args.push("-C".to_string());
        args.push(parent.to_string_lossy().to_string());
        args.push(name);
    }
    args
}

async fn entry_for(path: &Path) -> Result<BackupEntry, BackupError> {
    let meta = fs::metadata(path).await.map_err(io_err(path))?;
    let modified: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(BackupEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        modified,
    })
}

/// 列出目录中匹配模式的普通文件，最新在前；目录不存在时返回空列表
pub async fn list_matching(dir: &Path, pattern: &GlobPattern) -> Result<Vec<BackupEntry>, BackupError> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };

    let mut entries = Vec::new();
    while let Some(item) = read_dir.next_entry().await.map_err(io_err(dir))? {
        let name = item.file_name().to_string_lossy().to_string();
        if !pattern.matches(&name) {
            continue;
        }
        let file_type = item.file_type().await.map_err(io_err(&item.path()))?;
        if !file_type.is_file() {
            continue;
        }
        entries.push(entry_for(&item.path()).await?);
    }

    sort_newest_first(&mut entries);
    Ok(entries)
}

/// 保留最近 `keep` 个匹配文件，其余删除（`dry_run` 时只返回计划）
pub async fn prune_matching(
    dir: &Path,
    pattern: &GlobPattern,
    keep: usize,
    dry_run: bool,
) -> Result<RetentionPlan, BackupError> {
    let entries = list_matching(dir, pattern).await?;
    let plan = plan_retention(entries, keep);

    if !dry_run {
        for entry in &plan.prune {
            fs::remove_file(&entry.path).await.map_err(io_err(&entry.path))?;
            info!(file = %entry.name, "Removed old backup");
        }
    }

    info!(
        dir = %dir.display(),
        pattern = %pattern.as_str(),
        kept = plan.keep.len(),
        pruned = plan.prune.len(),
        dry_run = dry_run,
        "Backup retention applied"
    );

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::CommandRunner;
    use std::time::{Duration as StdDuration, SystemTime};

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - StdDuration::from_secs(age_secs))
            .unwrap();
    }

    fn config(root: &Path) -> BackupConfig {
        BackupConfig {
            data_dir: root.join(".n8n"),
            extra_paths: vec![root.join(".env"), root.join("missing.json")],
            backup_dir: root.join("backups"),
            prefix: "n8n_backup_".to_string(),
            keep: 2,
            github: None,
        }
    }

    #[tokio::test]
    async fn test_unused_archive_path_adds_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let name = "n8n_backup_20240101_030000.tar.gz";
        assert_eq!(unused_archive_path(dir.path(), name).await, dir.path().join(name));

        std::fs::write(dir.path().join(name), b"a").unwrap();
        std::fs::write(dir.path().join("n8n_backup_20240101_030000_1.tar.gz"), b"b").unwrap();
        assert_eq!(
            unused_archive_path(dir.path(), name).await,
            dir.path().join("n8n_backup_20240101_030000_2.tar.gz")
        );
    }

    #[tokio::test]
    async fn test_create_never_prunes_new_archive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".n8n")).unwrap();
        std::fs::write(dir.path().join(".n8n/config"), "{}").unwrap();
        let mut cfg = config(dir.path());
        cfg.keep = 0;
        let manager = BackupManager::new(Arc::new(CommandRunner), cfg);

        let first = manager.create(false).await.unwrap();
        assert!(first.entry.path.exists());
        assert!(first.retention.prune.is_empty());

        let second = manager.create(false).await.unwrap();
        assert_ne!(first.entry.name, second.entry.name);
        assert!(second.entry.path.exists());
        assert_eq!(second.retention.prune.len(), 1);
        assert_eq!(second.retention.prune[0].name, first.entry.name);
        assert!(!first.entry.path.exists());
    }

    #[test]
    fn test_tar_args() {
        let args = tar_args(
            Path::new("/b/x.tar.gz"),
            &[PathBuf::from("/root/.n8n"), PathBuf::from("/root/.env")],
        );
        assert_eq!(
            args,
            vec!["-czf", "/b/x.tar.gz", "-C", "/root", ".n8n", "-C", "/root", ".env"]
        );
    }

    #[tokio::test]
    async fn test_list_and_prune_only_touch_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "n8n_backup_1.tar.gz", 300);
        touch(dir.path(), "n8n_backup_2.tar.gz", 200);
        touch(dir.path(), "n8n_backup_3.tar.gz", 100);
        touch(dir.path(), "notes.txt", 1000);
        std::fs::create_dir(dir.path().join("n8n_backup_dir.tar.gz")).unwrap();

        let pattern = GlobPattern::new("n8n_backup_*.tar.gz").unwrap();
        let listed = list_matching(dir.path(), &pattern).await.unwrap();
        let names: Vec<_> = listed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["n8n_backup_3.tar.gz", "n8n_backup_2.tar.gz", "n8n_backup_1.tar.gz"]);

        let plan = prune_matching(dir.path(), &pattern, 1, true).await.unwrap();
        assert_eq!(plan.prune.len(), 2);
        assert!(dir.path().join("n8n_backup_1.tar.gz").exists());

        prune_matching(dir.path(), &pattern, 1, false).await.unwrap();
        assert!(dir.path().join("n8n_backup_3.tar.gz").exists());
        assert!(!dir.path().join("n8n_backup_2.tar.gz").exists());
        assert!(!dir.path().join("n8n_backup_1.tar.gz").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let pattern = GlobPattern::new("*").unwrap();
        let listed = list_matching(Path::new("/nonexistent/backups"), &pattern)
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(CommandRunner), config(dir.path()));

        let err = manager.create(false).await.unwrap_err();
        assert!(matches!(err, BackupError::MissingDataDir(_)));
    }

    #[tokio::test]
    async fn test_create_archives_and_applies_retention() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".n8n")).unwrap();
        std::fs::write(dir.path().join(".n8n/config"), "{}").unwrap();
        std::fs::write(dir.path().join(".env"), "N8N_PORT=5678").unwrap();
        std::fs::create_dir(dir.path().join("backups")).unwrap();
        touch(&dir.path().join("backups"), "n8n_backup_old1.tar.gz", 500);
        touch(&dir.path().join("backups"), "n8n_backup_old2.tar.gz", 400);

        let manager = BackupManager::new(Arc::new(CommandRunner), config(dir.path()));
        let created = manager.create(false).await.unwrap();

        assert!(created.entry.size_bytes > 0);
        assert_eq!(created.skipped, vec![dir.path().join("missing.json")]);
        assert_eq!(created.retention.keep.len(), 2);
        assert_eq!(created.retention.prune.len(), 1);
        assert_eq!(created.retention.prune[0].name, "n8n_backup_old1.tar.gz");
        assert!(created.upload.is_none());

        let latest = manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.name, created.entry.name);
    }

    #[tokio::test]
    async fn test_push_without_github_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(CommandRunner), config(dir.path()));
        let entry = BackupEntry {
            name: "x.tar.gz".to_string(),
            path: dir.path().join("x.tar.gz"),
            size_bytes: 0,
            modified: Utc::now(),
        };
        assert!(matches!(
            manager.push(&entry).await,
            Err(BackupError::GithubNotConfigured)
        ));
    }
}
