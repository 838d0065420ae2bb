//! 备份领域模型
//!
//! 保留策略：只保留匹配模式的最近 N 个文件

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

/// 备份文件
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// 保留计划
#[derive(Clone, Debug, Default, Serialize)]
pub struct RetentionPlan {
    pub keep: Vec<BackupEntry>,
    pub prune: Vec<BackupEntry>,
}

impl RetentionPlan {
    /// 被清理文件的总大小
    pub fn pruned_bytes(&self) -> u64 {
        self.prune.iter().map(|e| e.size_bytes).sum()
    }
}

/// 文件名通配模式，仅支持 `*` 和 `?`，按完整文件名匹配
#[derive(Clone, Debug)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        Ok(Self {
            raw: pattern.to_string(),
            regex: Regex::new(&expr)?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// 按"最新在前"排序：修改时间倒序，时间相同按文件名倒序
pub fn sort_newest_first(entries: &mut [BackupEntry]) {
    entries.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.name.cmp(&a.name))
    });
}

/// 计算保留计划：保留最近的 `keep` 个，其余清理
pub fn plan_retention(mut entries: Vec<BackupEntry>, keep: usize) -> RetentionPlan {
    sort_newest_first(&mut entries);
    let prune = if entries.len() > keep {
        entries.split_off(keep)
    } else {
        Vec::new()
    };
    RetentionPlan {
        keep: entries,
        prune,
    }
}

/// 生成带时间戳的归档文件名，如 `n8n_backup_20250717_031500.tar.gz`
pub fn archive_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}{}.tar.gz", prefix, at.format("%Y%m%d_%H%M%S"))
}
