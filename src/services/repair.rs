//! 修复流程
//!
//! 探测 → 备份 → 通过进程管理器回退链重启 → 验证 → 公网探测。
//! 同一时间只运行一个修复，日志广播到 LogHub 并转发到回调地址。

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::REPAIR_TIMEOUT_SECS;
use crate::domain::repair::{
    LogLine, RepairOptions, RepairStage, RepairStatus, RepairTask, RepairTrigger, StageStatus,
};
use crate::domain::supervisor::SupervisorKind;
use crate::state::AppState;

/// 取消时的退出码
pub const EXIT_CANCELLED: i32 = -2;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("repair {task_id} is already running")]
    AlreadyRunning { task_id: String },
}

/// 修复执行上下文
#[derive(Clone)]
pub struct RepairContext {
    pub task_id: String,
    pub state: Arc<AppState>,
    pub log_tx: Option<broadcast::Sender<LogLine>>,
    pub cancel_token: CancellationToken,
}

impl RepairContext {
    pub async fn log(&self, stream: &str, content: &str) {
        let line = LogLine::new(stream, content);

        if let Some(ref tx) = self.log_tx {
            let _ = tx.send(line.clone());
        }

        self.state.notifier.append_log(&self.task_id, &line).await;
    }

    pub async fn log_stdout(&self, content: &str) {
        self.log("stdout", content).await;
    }

    pub async fn log_stderr(&self, content: &str) {
        self.log("stderr", content).await;
    }

    pub async fn update_stages(&self, stages: &[RepairStage]) {
        self.state
            .task_store
            .update_stages(&self.task_id, stages.to_vec())
            .await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 完成任务：更新存储、关闭日志通道、释放运行槽位、通知回调
    async fn finish(&self, status: RepairStatus, exit_code: i32, stages: &[RepairStage]) {
        self.update_stages(stages).await;
        self.state
            .task_store
            .finish(&self.task_id, status.clone(), Some(exit_code))
            .await;
        self.state.log_hub.finish(&self.task_id).await;
        self.state.unregister_repair(&self.task_id).await;

        let _ = self
            .state
            .notifier
            .notify_status(&self.task_id, &status, exit_code, stages)
            .await;
    }
}

/// 各阶段执行结果
enum Outcome {
    Success,
    Failed,
    Cancelled,
}

/// 注册修复任务并创建日志通道，返回任务 ID 与取消令牌
///
/// 已有修复在运行时返回 `AlreadyRunning`
pub async fn prepare(
    state: &AppState,
    trigger: RepairTrigger,
) -> Result<(String, CancellationToken), RepairError> {
    let task_id = uuid::Uuid::new_v4().to_string();
    let cancel_token = state
        .try_register_repair(&task_id)
        .await
        .map_err(|running| RepairError::AlreadyRunning { task_id: running })?;

    state
        .task_store
        .create(RepairTask::new(task_id.clone(), trigger))
        .await;
    state.log_hub.create(&task_id).await;

    tracing::info!(task_id = %task_id, trigger = ?trigger, "Repair registered");
    Ok((task_id, cancel_token))
}

/// 在后台启动修复，立即返回任务 ID
pub async fn start(
    state: Arc<AppState>,
    trigger: RepairTrigger,
    options: RepairOptions,
) -> Result<String, RepairError> {
    let (task_id, cancel_token) = prepare(&state, trigger).await?;
    tokio::spawn(execute(state, task_id.clone(), options, cancel_token));
    Ok(task_id)
}

/// 执行已注册的修复，返回最终任务
pub async fn execute(
    state: Arc<AppState>,
    task_id: String,
    options: RepairOptions,
    cancel_token: CancellationToken,
) -> Option<RepairTask> {
    let ctx = RepairContext {
        task_id: task_id.clone(),
        state: state.clone(),
        log_tx: state.log_hub.get_sender(&task_id).await,
        cancel_token: cancel_token.clone(),
    };

    let timeout_task = spawn_timeout(
        task_id.clone(),
        cancel_token.clone(),
        Duration::from_secs(REPAIR_TIMEOUT_SECS),
    );

    let mut stages = vec![
        RepairStage::new("probe", "Probe n8n"),
        RepairStage::new("backup", "Backup data"),
        RepairStage::new("restart", "Restart n8n"),
        RepairStage::new("verify", "Verify n8n"),
        RepairStage::new("public", "Probe public URL"),
    ];
    ctx.update_stages(&stages).await;

    let outcome = run_stages(&ctx, &options, &mut stages).await;
    timeout_task.abort();

    let (status, exit_code) = match outcome {
        Outcome::Success => {
            ctx.log_stdout("Repair finished: n8n is healthy").await;
            (RepairStatus::Success, 0)
        }
        Outcome::Failed => {
            ctx.log_stderr("Repair failed").await;
            (RepairStatus::Failed, 1)
        }
        Outcome::Cancelled => {
            for stage in stages.iter_mut().filter(|s| s.status == StageStatus::Pending) {
                stage.skip(Some("cancelled".to_string()));
            }
            ctx.log_stderr("Repair cancelled").await;
            (RepairStatus::Failed, EXIT_CANCELLED)
        }
    };

    tracing::info!(
        task_id = %task_id,
        status = %status.as_str(),
        exit_code = exit_code,
        "Repair completed"
    );

    ctx.finish(status, exit_code, &stages).await;
    state.task_store.get_any(&task_id).await
}

async fn run_stages(ctx: &RepairContext, options: &RepairOptions, stages: &mut [RepairStage]) -> Outcome {
    let state = &ctx.state;
    let n8n = &state.config.n8n;
    let settings = n8n.probe_settings();

    // 1. probe
    stages[0].start();
    ctx.update_stages(stages).await;
    let report = state
        .probe
        .wait_until_healthy(&settings.single_attempt(), &ctx.cancel_token)
        .await;
    ctx.log_stdout(&report.summary()).await;
    if ctx.is_cancelled() {
        stages[0].finish(false, Some("cancelled".to_string()));
        return Outcome::Cancelled;
    }

    if report.healthy && !options.force {
        stages[0].finish(true, Some(report.summary()));
        for stage in stages.iter_mut().skip(1) {
            stage.skip(Some("n8n already healthy".to_string()));
        }
        return Outcome::Success;
    }
    let message = if report.healthy {
        "n8n is healthy, restart forced".to_string()
    } else {
        report.summary()
    };
    stages[0].finish(true, Some(message));
    ctx.update_stages(stages).await;

    // 2. backup
    if options.backup_first {
        stages[1].start();
        ctx.update_stages(stages).await;
        ctx.log_stdout("Creating backup before restart").await;
        match state.backups.create(false).await {
            Ok(created) => {
                let message = format!("{} ({} bytes)", created.entry.name, created.entry.size_bytes);
                ctx.log_stdout(&format!("Backup created: {}", message)).await;
                stages[1].finish(true, Some(message));
            }
            Err(e) => {
                // 备份失败不阻止重启
                ctx.log_stderr(&format!("Backup failed, continuing: {}", e)).await;
                stages[1].finish(false, Some(e.to_string()));
            }
        }
    } else {
        stages[1].skip(Some("disabled".to_string()));
    }
    ctx.update_stages(stages).await;

    if ctx.is_cancelled() {
        return Outcome::Cancelled;
    }

    // 3. restart
    stages[2].start();
    ctx.update_stages(stages).await;
    let mut attempt_lines = Vec::new();
    let restarted = tokio::select! {
        _ = ctx.cancel_token.cancelled() => {
            stages[2].finish(false, Some("cancelled".to_string()));
            return Outcome::Cancelled;
        }
        result = state.supervisors.restart_with_fallback(|attempt| {
            attempt_lines.push((attempt.success, format!("{}: {}", attempt.kind, attempt.message)));
        }) => result,
    };
    for (success, line) in &attempt_lines {
        if *success {
            ctx.log_stdout(line).await;
        } else {
            ctx.log_stderr(line).await;
        }
    }

    let winner: SupervisorKind = match restarted {
        Ok(outcome) => {
            stages[2].finish(true, Some(format!("restarted via {}", outcome.kind)));
            outcome.kind
        }
        Err(e) => {
            ctx.log_stderr(&e.to_string()).await;
            stages[2].finish(false, Some(e.to_string()));
            for stage in stages.iter_mut().skip(3) {
                stage.skip(Some("restart failed".to_string()));
            }
            return Outcome::Failed;
        }
    };
    state.task_store.set_supervisor(&ctx.task_id, winner).await;
    ctx.update_stages(stages).await;

    // 4. verify
    stages[3].start();
    ctx.update_stages(stages).await;
    ctx.log_stdout(&format!(
        "Waiting for n8n at {} (up to {} attempts)",
        settings.url, settings.max_attempts
    ))
    .await;
    let report = state.probe.wait_until_healthy(&settings, &ctx.cancel_token).await;
    ctx.log_stdout(&report.summary()).await;
    if ctx.is_cancelled() {
        stages[3].finish(false, Some("cancelled".to_string()));
        return Outcome::Cancelled;
    }
    if !report.healthy {
        stages[3].finish(false, Some(report.summary()));
        stages[4].skip(Some("n8n not healthy".to_string()));
        return Outcome::Failed;
    }
    stages[3].finish(true, Some(report.summary()));
    ctx.update_stages(stages).await;

    // 5. public
    match n8n.public_url {
        Some(ref url) => {
            stages[4].start();
            let report = state
                .probe
                .wait_until_healthy(&settings.with_url(url.as_str()).single_attempt(), &ctx.cancel_token)
                .await;
            if report.healthy {
                ctx.log_stdout(&report.summary()).await;
            } else {
                // 域名 / 代理问题不在本机范围内，只告警
                ctx.log_stderr(&format!("Public URL check failed: {}", report.summary()))
                    .await;
            }
            stages[4].finish(report.healthy, Some(report.summary()));
        }
        None => stages[4].skip(Some("no public URL configured".to_string())),
    }

    Outcome::Success
}

/// 超时后取消修复
fn spawn_timeout(
    task_id: String,
    cancel_token: CancellationToken,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tracing::error!(task_id = %task_id, timeout = ?timeout, "Repair timed out");
        cancel_token.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::infra::command::fake::FakeExec;
    use crate::infra::command::{CommandError, CommandExec, CommandOutput, CommandSpec};
    use async_trait::async_trait;
    use axum::{http::StatusCode, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 前 `failures` 次返回 500，之后返回 401（n8n 开启认证时的正常响应）
    async fn flaky_n8n(failures: usize) -> String {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/",
            get(move || {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < failures {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::UNAUTHORIZED
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    /// `systemctl restart` 卡住，其他命令立即成功
    struct HangingRestart;

    #[async_trait]
    impl CommandExec for HangingRestart {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            if spec.display().starts_with("systemctl restart") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(CommandOutput {
                code: Some(0),
                ..Default::default()
            })
        }
    }

    fn state(url: &str, exec: FakeExec) -> Arc<AppState> {
        state_with(url, Arc::new(exec))
    }

    fn state_with(url: &str, exec: Arc<dyn CommandExec>) -> Arc<AppState> {
        let mut config = EnvConfig::from_env();
        config.callback_url = None;
        config.n8n.local_url = url.to_string();
        config.n8n.public_url = None;
        config.n8n.probe_attempts = 3;
        config.n8n.probe_interval_secs = 0;
        config.n8n.probe_timeout_secs = 2;
        config.supervisor.order = SupervisorKind::default_order();
        Arc::new(AppState::with_exec(config, exec))
    }

    fn no_backup() -> RepairOptions {
        RepairOptions {
            force: false,
            backup_first: false,
        }
    }

    async fn run(state: &Arc<AppState>, options: RepairOptions) -> RepairTask {
        let (task_id, token) = prepare(state, RepairTrigger::Manual).await.unwrap();
        execute(state.clone(), task_id, options, token).await.unwrap()
    }

    #[tokio::test]
    async fn test_healthy_n8n_skips_restart() {
        let url = flaky_n8n(0).await;
        let exec = FakeExec::new();
        let state = state(&url, exec);

        let task = run(&state, RepairOptions::default()).await;
        assert_eq!(task.status, RepairStatus::Success);
        assert_eq!(task.exit_code, Some(0));
        assert!(task.supervisor.is_none());
        assert!(task.stages[1..].iter().all(|s| s.status == StageStatus::Skipped));
        assert!(state.running_repair_id().await.is_none());
    }

    #[tokio::test]
    async fn test_restart_then_verify() {
        let url = flaky_n8n(2).await;
        let state = state(&url, FakeExec::new().on("systemctl restart", 0, ""));

        let task = run(&state, no_backup()).await;
        assert_eq!(task.status, RepairStatus::Success);
        assert_eq!(task.supervisor, Some(SupervisorKind::Systemd));
        assert_eq!(task.stages[1].status, StageStatus::Skipped);
        assert_eq!(task.stages[2].status, StageStatus::Success);
        assert_eq!(task.stages[3].status, StageStatus::Success);
        assert_eq!(task.stages[4].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_all_supervisors_fail() {
        let url = flaky_n8n(usize::MAX).await;
        let state = state(&url, FakeExec::new());

        let task = run(&state, no_backup()).await;
        assert_eq!(task.status, RepairStatus::Failed);
        assert_eq!(task.exit_code, Some(1));
        assert_eq!(task.stages[2].status, StageStatus::Failed);
        assert_eq!(task.stages[3].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_verify_failure_fails_task() {
        let url = flaky_n8n(usize::MAX).await;
        let state = state(&url, FakeExec::new().on("systemctl restart", 0, ""));

        let task = run(&state, no_backup()).await;
        assert_eq!(task.status, RepairStatus::Failed);
        assert_eq!(task.stages[3].status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn test_backup_failure_is_not_fatal() {
        let url = flaky_n8n(1).await;
        let mut config = EnvConfig::from_env();
        config.callback_url = None;
        config.n8n.local_url = url;
        config.n8n.public_url = None;
        config.n8n.probe_interval_secs = 0;
        config.backup.data_dir = "/nonexistent/.n8n".into();
        let state = Arc::new(AppState::with_exec(
            config,
            Arc::new(FakeExec::new().on("systemctl restart", 0, "")),
        ));

        let task = run(&state, RepairOptions::default()).await;
        assert_eq!(task.status, RepairStatus::Success);
        assert_eq!(task.stages[1].status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn test_second_repair_conflicts() {
        let state = state("http://127.0.0.1:1", FakeExec::new());
        let (first, _token) = prepare(&state, RepairTrigger::Api).await.unwrap();

        match prepare(&state, RepairTrigger::Watchdog).await {
            Err(RepairError::AlreadyRunning { task_id }) => assert_eq!(task_id, first),
            Ok(_) => panic!("second repair should conflict"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_repair_exit_code() {
        let state = state("http://127.0.0.1:1", FakeExec::new());
        let (task_id, token) = prepare(&state, RepairTrigger::Api).await.unwrap();
        token.cancel();

        let task = execute(state.clone(), task_id, no_backup(), token).await.unwrap();
        assert_eq!(task.status, RepairStatus::Failed);
        assert_eq!(task.exit_code, Some(EXIT_CANCELLED));
        assert_eq!(task.stages[2].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_during_restart() {
        let state = state_with("http://127.0.0.1:1/", Arc::new(HangingRestart));
        let (task_id, token) = prepare(&state, RepairTrigger::Api).await.unwrap();
        let handle = tokio::spawn(execute(state.clone(), task_id.clone(), no_backup(), token.clone()));

        let mut restarting = false;
        for _ in 0..50 {
            let task = state.task_store.get(&task_id).await.unwrap();
            if task.stages[2].status == StageStatus::Running {
                restarting = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(restarting);
        assert!(state.cancel_repair(&task_id).await);

        let task = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancelled repair should finish promptly")
            .unwrap()
            .unwrap();
        assert_eq!(task.exit_code, Some(EXIT_CANCELLED));
        assert_eq!(task.stages[2].status, StageStatus::Failed);
        assert_eq!(task.stages[2].message.as_deref(), Some("cancelled"));
        assert_eq!(task.stages[3].status, StageStatus::Skipped);
        assert!(state.running_repair_id().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_cancels_token() {
        let token = CancellationToken::new();
        spawn_timeout("t".to_string(), token.clone(), Duration::from_millis(50));

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("timeout should cancel the repair");
    }
}
