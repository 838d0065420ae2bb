//! 主机负载 API
//!
//! GET /system/stats

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

use crate::domain::system::{percent, DiskInfo, LoadAverage, SystemStats};
use crate::state::AppState;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/system/stats", get(get_system_stats))
}

/// GET /system/stats
/// 无需认证
async fn get_system_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(collect_stats(&state).await)
}

/// 采集 CPU / 内存 / 磁盘 / 负载，以及备份目录占用
pub async fn collect_stats(state: &AppState) -> SystemStats {
    let mut sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything()),
    );

    // 两次采样之间需要间隔，CPU 使用率才准确
    sys.refresh_cpu_all();
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    sys.refresh_cpu_all();

    let disks: Vec<DiskInfo> = Disks::new_with_refreshed_list()
        .iter()
        .map(|disk| {
            let total = disk.total_space() as f64 / GB;
            let available = disk.available_space() as f64 / GB;
            let used = total - available;
            DiskInfo {
                name: disk.name().to_string_lossy().to_string(),
                mount_point: disk.mount_point().to_string_lossy().to_string(),
                total_gb: total,
                used_gb: used,
                available_gb: available,
                usage_percent: percent(used, total),
            }
        })
        .collect();

    let cpu_usage = if sys.cpus().is_empty() {
        0.0
    } else {
        sys.cpus().iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / sys.cpus().len() as f64
    };

    let memory_total = sys.total_memory() as f64 / GB;
    let memory_used = sys.used_memory() as f64 / GB;
    let load = System::load_average();

    let backup_dir_bytes = match state.backups.list().await {
        Ok(entries) => entries.iter().map(|e| e.size_bytes).sum(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list backups");
            0
        }
    };

    SystemStats {
        timestamp: chrono::Utc::now(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
        cpu_usage_percent: cpu_usage,
        memory_used_gb: memory_used,
        memory_total_gb: memory_total,
        memory_usage_percent: percent(memory_used, memory_total),
        disks,
        load_average: LoadAverage::new(load.one, load.five, load.fifteen),
        backup_dir_bytes,
    }
}
