//! 进程管理器回退链
//!
//! 同一台机器上 n8n 曾先后被 systemd、PM2、Docker 托管。
//! 按配置顺序依次尝试重启，第一个成功的管理器胜出；
//! 换下一个之前先停掉失败的那个，避免两个管理器争抢 5678 端口。

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::domain::supervisor::{ServiceState, SupervisorKind, SupervisorStatus};
use crate::infra::command::{CommandError, CommandExec, CommandSpec};

/// 进程管理器错误
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{kind}: {source}")]
    Command {
        kind: SupervisorKind,
        #[source]
        source: CommandError,
    },
    #[error("{kind}: `{command}` failed: {message}")]
    Failed {
        kind: SupervisorKind,
        command: String,
        message: String,
    },
    #[error("no supervisor could restart n8n ({})", summarize(.0))]
    AllFailed(Vec<RestartAttempt>),
    #[error("no supervisor configured")]
    NoneConfigured,
}

fn summarize(attempts: &[RestartAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.kind, a.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 一次重启尝试
#[derive(Clone, Debug, Serialize)]
pub struct RestartAttempt {
    pub kind: SupervisorKind,
    pub success: bool,
    pub message: String,
}

/// 重启成功的结果
#[derive(Clone, Debug, Serialize)]
pub struct RestartOutcome {
    /// 胜出的管理器
    pub kind: SupervisorKind,
    pub attempts: Vec<RestartAttempt>,
}

/// 进程管理器回退链
#[derive(Clone)]
pub struct SupervisorChain {
    exec: Arc<dyn CommandExec>,
    config: SupervisorConfig,
}

impl SupervisorChain {
    pub fn new(exec: Arc<dyn CommandExec>, config: SupervisorConfig) -> Self {
        Self { exec, config }
    }

    pub fn order(&self) -> &[SupervisorKind] {
        &self.config.order
    }

    fn spec(&self, program: &str, args: Vec<String>) -> CommandSpec {
        CommandSpec::new(program, args)
            .timeout(Duration::from_secs(self.config.command_timeout_secs))
    }

    fn compose_args(&self, tail: &[&str]) -> Option<Vec<String>> {
        let file = self.config.compose_file.as_ref()?;
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            file.to_string_lossy().to_string(),
        ];
        args.extend(tail.iter().map(|s| s.to_string()));
        Some(args)
    }

    /// 查询单个管理器状态
    pub async fn status(&self, kind: SupervisorKind) -> SupervisorStatus {
        let result = match kind {
            SupervisorKind::Systemd => self.systemd_status().await,
            SupervisorKind::Pm2 => self.pm2_status().await,
            SupervisorKind::Docker => self.docker_status().await,
        };

        match result {
            Ok((state, detail)) => SupervisorStatus { kind, state, detail },
            Err(e) => SupervisorStatus {
                kind,
                state: ServiceState::Unknown,
                detail: Some(e.to_string()),
            },
        }
    }

    /// 查询所有已配置管理器的状态
    pub async fn status_all(&self) -> Vec<SupervisorStatus> {
        let mut statuses = Vec::with_capacity(self.config.order.len());
        for kind in &self.config.order {
            statuses.push(self.status(*kind).await);
        }
        statuses
    }

    async fn systemd_status(&self) -> Result<(ServiceState, Option<String>), CommandError> {
        let output = self
            .exec
            .run(&self.spec(
                "systemctl",
                vec!["is-active".to_string(), self.config.service_name.clone()],
            ))
            .await?;
        // is-active 在非 active 时退出码非 0，但 stdout 依然给出状态
        Ok((ServiceState::from_systemctl(&output.stdout), None))
    }

    async fn pm2_status(&self) -> Result<(ServiceState, Option<String>), CommandError> {
        let output = self
            .exec
            .run(&self.spec("pm2", vec!["jlist".to_string()]))
            .await?;
        if !output.success() {
            return Ok((ServiceState::Unknown, Some(output.error_summary())));
        }
        Ok(parse_pm2_jlist(&output.stdout, &self.config.service_name))
    }

    async fn docker_status(&self) -> Result<(ServiceState, Option<String>), CommandError> {
        let output = self
            .exec
            .run(&self.spec(
                "docker",
                vec![
                    "inspect".to_string(),
                    "-f".to_string(),
                    "{{.State.Status}}".to_string(),
                    self.config.docker_container.clone(),
                ],
            ))
            .await?;
        if output.success() {
            Ok((ServiceState::from_docker(&output.stdout), None))
        } else {
            Ok((ServiceState::Inactive, Some(output.error_summary())))
        }
    }

    /// 用指定管理器重启 n8n
    pub async fn restart(&self, kind: SupervisorKind) -> Result<(), SupervisorError> {
        let spec = match kind {
            SupervisorKind::Systemd => self.spec(
                "systemctl",
                vec!["restart".to_string(), self.config.service_name.clone()],
            ),
            SupervisorKind::Pm2 => {
                let (state, detail) = self.pm2_status().await.map_err(|source| {
                    SupervisorError::Command { kind, source }
                })?;
                let unknown_app = state == ServiceState::Inactive && detail.is_some();
                if unknown_app {
                    // pm2 里没有这个应用，从 ecosystem 文件启动
                    self.spec(
                        "pm2",
                        vec![
                            "start".to_string(),
                            self.config.pm2_ecosystem.to_string_lossy().to_string(),
                        ],
                    )
                } else {
                    self.spec(
                        "pm2",
                        vec![
                            "restart".to_string(),
                            self.config.service_name.clone(),
                            "--update-env".to_string(),
                        ],
                    )
                }
            }
            SupervisorKind::Docker => match self.compose_args(&["up", "-d"]) {
                Some(args) => self.spec("docker", args),
                None => self.spec(
                    "docker",
                    vec!["restart".to_string(), self.config.docker_container.clone()],
                ),
            },
        };

        self.run_checked(kind, spec).await
    }

    /// 用指定管理器停止 n8n
    pub async fn stop(&self, kind: SupervisorKind) -> Result<(), SupervisorError> {
        let spec = match kind {
            SupervisorKind::Systemd => self.spec(
                "systemctl",
                vec!["stop".to_string(), self.config.service_name.clone()],
            ),
            SupervisorKind::Pm2 => self.spec(
                "pm2",
                vec!["stop".to_string(), self.config.service_name.clone()],
            ),
            SupervisorKind::Docker => match self.compose_args(&["stop"]) {
                Some(args) => self.spec("docker", args),
                None => self.spec(
                    "docker",
                    vec!["stop".to_string(), self.config.docker_container.clone()],
                ),
            },
        };

        self.run_checked(kind, spec).await
    }

    async fn run_checked(&self, kind: SupervisorKind, spec: CommandSpec) -> Result<(), SupervisorError> {
        let output = self
            .exec
            .run(&spec)
            .await
            .map_err(|source| SupervisorError::Command { kind, source })?;

        if output.success() {
            Ok(())
        } else {
            Err(SupervisorError::Failed {
                kind,
                command: spec.display(),
                message: output.error_summary(),
            })
        }
    }

    /// 按回退顺序重启，每次尝试后回调 `on_attempt`
    pub async fn restart_with_fallback<F>(&self, mut on_attempt: F) -> Result<RestartOutcome, SupervisorError>
    where
        F: FnMut(&RestartAttempt),
    {
        if self.config.order.is_empty() {
            return Err(SupervisorError::NoneConfigured);
        }

        let mut attempts = Vec::new();
        for kind in &self.config.order {
            let kind = *kind;
            let attempt = match self.restart(kind).await {
                Ok(()) => {
                    info!(supervisor = %kind, "n8n restarted");
                    RestartAttempt {
                        kind,
                        success: true,
                        message: "restarted".to_string(),
                    }
                }
                Err(e) => {
                    warn!(supervisor = %kind, error = %e, "Restart failed, trying next supervisor");
                    RestartAttempt {
                        kind,
                        success: false,
                        message: e.to_string(),
                    }
                }
            };
            on_attempt(&attempt);

            let success = attempt.success;
            attempts.push(attempt);
            if success {
                return Ok(RestartOutcome { kind, attempts });
            }

            // 尽力停掉失败的管理器，错误忽略
            let _ = self.stop(kind).await;
        }

        Err(SupervisorError::AllFailed(attempts))
    }
}

/// 解析 `pm2 jlist` 输出，查找指定名称的应用
fn parse_pm2_jlist(stdout: &str, name: &str) -> (ServiceState, Option<String>) {
    // pm2 有时在 JSON 前打印升级提示，从第一个 '[' 开始解析
    let json = stdout.find('[').map(|i| &stdout[i..]).unwrap_or(stdout);
    let apps: Vec<serde_json::Value> = match serde_json::from_str(json) {
        Ok(apps) => apps,
        Err(e) => return (ServiceState::Unknown, Some(format!("invalid pm2 jlist output: {}", e))),
    };

    let status = apps
        .iter()
        .find(|app| app.get("name").and_then(|n| n.as_str()) == Some(name))
        .and_then(|app| app.pointer("/pm2_env/status"))
        .and_then(|s| s.as_str());

    match status {
        Some(status) => (ServiceState::from_pm2(status), None),
        None => (
            ServiceState::Inactive,
            Some(format!("pm2 has no app named '{}'", name)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::command::fake::FakeExec;
    use std::path::PathBuf;

    fn config(order: Vec<SupervisorKind>) -> SupervisorConfig {
        SupervisorConfig {
            order,
            service_name: "n8n".to_string(),
            pm2_ecosystem: PathBuf::from("/root/n8n-ecosystem.json"),
            docker_container: "n8n".to_string(),
            compose_file: None,
            command_timeout_secs: 5,
        }
    }

    #[test]
    fn test_parse_pm2_jlist() {
        let out = r#"[{"name":"n8n","pm2_env":{"status":"online"}}]"#;
        assert_eq!(parse_pm2_jlist(out, "n8n").0, ServiceState::Active);

        let out = "[PM2] update available\n[{\"name\":\"other\",\"pm2_env\":{\"status\":\"online\"}}]";
        let (state, detail) = parse_pm2_jlist(out, "n8n");
        assert_eq!(state, ServiceState::Inactive);
        assert!(detail.unwrap().contains("no app named"));

        assert_eq!(parse_pm2_jlist("garbage", "n8n").0, ServiceState::Unknown);
    }

    #[tokio::test]
    async fn test_first_supervisor_wins() {
        let exec = Arc::new(FakeExec::new().on("systemctl restart n8n", 0, ""));
        let chain = SupervisorChain::new(exec.clone(), config(SupervisorKind::default_order()));

        let outcome = chain.restart_with_fallback(|_| {}).await.unwrap();
        assert_eq!(outcome.kind, SupervisorKind::Systemd);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(exec.calls(), vec!["systemctl restart n8n"]);
    }

    #[tokio::test]
    async fn test_falls_back_and_stops_failed_supervisor() {
        let exec = Arc::new(
            FakeExec::new()
                .on("systemctl", 5, "")
                .on("pm2 jlist", 0, r#"[{"name":"n8n","pm2_env":{"status":"errored"}}]"#)
                .on("pm2 restart n8n", 0, ""),
        );
        let chain = SupervisorChain::new(exec.clone(), config(SupervisorKind::default_order()));

        let mut seen = Vec::new();
        let outcome = chain
            .restart_with_fallback(|a| seen.push((a.kind, a.success)))
            .await
            .unwrap();

        assert_eq!(outcome.kind, SupervisorKind::Pm2);
        assert_eq!(
            seen,
            vec![(SupervisorKind::Systemd, false), (SupervisorKind::Pm2, true)]
        );
        assert_eq!(
            exec.calls(),
            vec![
                "systemctl restart n8n",
                "systemctl stop n8n",
                "pm2 jlist",
                "pm2 restart n8n --update-env",
            ]
        );
    }

    #[tokio::test]
    async fn test_pm2_starts_ecosystem_when_app_unknown() {
        let exec = Arc::new(
            FakeExec::new()
                .on("pm2 jlist", 0, "[]")
                .on("pm2 start", 0, ""),
        );
        let chain = SupervisorChain::new(exec.clone(), config(vec![SupervisorKind::Pm2]));

        chain.restart(SupervisorKind::Pm2).await.unwrap();
        assert_eq!(exec.calls()[1], "pm2 start /root/n8n-ecosystem.json");
    }

    #[tokio::test]
    async fn test_all_failed() {
        // 没有任何规则：所有命令都视为不存在
        let exec = Arc::new(FakeExec::new());
        let chain = SupervisorChain::new(exec, config(vec![SupervisorKind::Systemd, SupervisorKind::Docker]));

        let err = chain.restart_with_fallback(|_| {}).await.unwrap_err();
        match err {
            SupervisorError::AllFailed(attempts) => {
                assert_eq!(attempts.len(), 2);
                assert!(attempts.iter().all(|a| !a.success));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_docker_uses_compose_when_configured() {
        let exec = Arc::new(FakeExec::new().on("docker compose", 0, ""));
        let mut cfg = config(vec![SupervisorKind::Docker]);
        cfg.compose_file = Some(PathBuf::from("/opt/n8n/docker-compose.yml"));
        let chain = SupervisorChain::new(exec.clone(), cfg);

        chain.restart(SupervisorKind::Docker).await.unwrap();
        assert_eq!(exec.calls(), vec!["docker compose -f /opt/n8n/docker-compose.yml up -d"]);
    }

    #[tokio::test]
    async fn test_status_unknown_when_tool_missing() {
        let exec = Arc::new(FakeExec::new().on("systemctl is-active", 3, "inactive\n"));
        let chain = SupervisorChain::new(exec, config(vec![SupervisorKind::Systemd, SupervisorKind::Docker]));

        let statuses = chain.status_all().await;
        assert_eq!(statuses[0].state, ServiceState::Inactive);
        assert_eq!(statuses[1].state, ServiceState::Unknown);
        assert!(statuses[1].detail.is_some());
    }
}
