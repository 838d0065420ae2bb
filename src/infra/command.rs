//! 命令执行器
//!
//! 提供统一的外部命令执行接口，支持：
//! - 超时控制
//! - 向 stdin 写入内容（`crontab -`）
//! - stdout/stderr 分离
//!
//! 上层通过 `CommandExec` trait 调用，测试中可替换为假实现

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败（通常是程序不存在）
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    /// 命令超时
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    /// 写 stdin 或等待结束失败
    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// 待执行的命令
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            work_dir: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// 形如 `systemctl restart n8n` 的展示文本
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// 命令执行结果
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// 退出码（被信号终止时为 None）
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr 优先的错误摘要
    pub fn error_summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.code.map_or("none".to_string(), |c| c.to_string()))
    }
}

/// 外部命令执行抽象
#[async_trait]
pub trait CommandExec: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// 基于 tokio::process 的命令执行器
#[derive(Clone, Debug, Default)]
pub struct CommandRunner;

#[async_trait]
impl CommandExec for CommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec.display(), "Running command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CommandError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        if let Some(ref input) = spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(|source| CommandError::Io {
                        program: spec.program.clone(),
                        source,
                    })?;
                // 关闭 stdin，让 `crontab -` 之类的命令读到 EOF
                drop(stdin);
            }
        }

        // 超时后 child 随 future 一起被 drop，kill_on_drop 负责结束进程
        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(source)) => Err(CommandError::Io {
                program: spec.program.clone(),
                source,
            }),
            Err(_) => {
                warn!(command = %spec.display(), timeout = ?spec.timeout, "Command timed out");
                Err(CommandError::Timeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                })
            }
        }
    }
}

/// 测试用的脚本化命令执行器
#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// 按命令前缀匹配的预设响应；未匹配的命令视为程序不存在
    #[derive(Default)]
    pub struct FakeExec {
        rules: Mutex<Vec<(String, CommandOutput)>>,
        calls: Mutex<Vec<String>>,
        inputs: Mutex<Vec<String>>,
    }

    impl FakeExec {
        pub fn new() -> Self {
            Self::default()
        }

        /// 预设响应，后加入的规则优先
        pub fn on(self, prefix: &str, code: i32, stdout: &str) -> Self {
            self.rules.lock().unwrap().insert(
                0,
                (
                    prefix.to_string(),
                    CommandOutput {
                        code: Some(code),
                        stdout: stdout.to_string(),
                        stderr: if code == 0 { String::new() } else { format!("{} failed", prefix) },
                    },
                ),
            );
            self
        }

        /// 预设完整输出（需要自定义 stderr 时使用）
        pub fn on_output(self, prefix: &str, output: CommandOutput) -> Self {
            self.rules.lock().unwrap().insert(0, (prefix.to_string(), output));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// 所有写入 stdin 的内容
        pub fn inputs(&self) -> Vec<String> {
            self.inputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExec for FakeExec {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            let display = spec.display();
            self.calls.lock().unwrap().push(display.clone());
            if let Some(ref input) = spec.stdin {
                self.inputs.lock().unwrap().push(input.clone());
            }
            let rules = self.rules.lock().unwrap();
            match rules.iter().find(|(prefix, _)| display.starts_with(prefix.as_str())) {
                Some((_, output)) => Ok(output.clone()),
                None => Err(CommandError::SpawnFailed {
                    program: spec.program.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }
}
