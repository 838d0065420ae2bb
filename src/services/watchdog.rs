//! 看门狗
//!
//! 定时单次探测 n8n，连续失败达到阈值后自动发起修复

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::repair::{RepairOptions, RepairTrigger};
use crate::services::repair::{self, RepairError};
use crate::state::AppState;

/// 连续失败计数
#[derive(Debug)]
pub struct FailureCounter {
    consecutive: u32,
    threshold: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// 记录一次探测结果，达到阈值时返回 true 并清零
    pub fn record(&mut self, healthy: bool) -> bool {
        if healthy {
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.consecutive = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// 启动看门狗后台任务
pub fn spawn(state: Arc<AppState>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(state, shutdown))
}

pub async fn run(state: Arc<AppState>, shutdown: CancellationToken) {
    let config = &state.config.watchdog;
    let settings = state.config.n8n.probe_settings().single_attempt();
    let mut counter = FailureCounter::new(config.failure_threshold);
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));

    info!(
        interval_secs = config.interval_secs,
        threshold = config.failure_threshold,
        url = %settings.url,
        "Watchdog started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Watchdog stopped");
                break;
            }
            _ = interval.tick() => {}
        }

        // 修复进行中不计数
        if let Some(task_id) = state.running_repair_id().await {
            debug!(task_id = %task_id, "Repair in progress, watchdog idle");
            counter.reset();
            continue;
        }

        let report = state.probe.wait_until_healthy(&settings, &shutdown).await;
        if shutdown.is_cancelled() {
            break;
        }
        if report.healthy {
            counter.record(true);
            continue;
        }

        warn!(
            consecutive = counter.consecutive() + 1,
            threshold = config.failure_threshold,
            summary = %report.summary(),
            "n8n probe failed"
        );

        if !counter.record(false) {
            continue;
        }

        match repair::start(state.clone(), RepairTrigger::Watchdog, RepairOptions::default()).await {
            Ok(task_id) => info!(task_id = %task_id, "Watchdog started repair"),
            Err(RepairError::AlreadyRunning { task_id }) => {
                debug!(task_id = %task_id, "Repair already running")
            }
        }
    }
}
