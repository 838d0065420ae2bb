//! 主机负载领域模型

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 磁盘信息
#[derive(Clone, Debug, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub mount_point: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
}

/// 主机负载统计
#[derive(Clone, Debug, Serialize)]
pub struct SystemStats {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub cpu_usage_percent: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub memory_usage_percent: f64,
    pub disks: Vec<DiskInfo>,
    pub load_average: LoadAverage,
    /// 备份目录占用（字节）
    pub backup_dir_bytes: u64,
}

/// 系统负载平均值 (1, 5, 15 分钟)
#[derive(Clone, Debug, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverage {
    pub fn new(one: f64, five: f64, fifteen: f64) -> Self {
        Self { one, five, fifteen }
    }
}

/// 百分比，分母为 0 时返回 0
pub fn percent(used: f64, total: f64) -> f64 {
    if total > 0.0 {
        (used / total) * 100.0
    } else {
        0.0
    }
}
