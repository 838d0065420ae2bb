//! 基础设施模块
//!
//! 封装外部依赖（HTTP client、命令执行等）

pub mod command;
pub mod github;
pub mod notifier;
pub mod probe;

pub use command::{CommandExec, CommandOutput, CommandRunner, CommandSpec};
pub use github::GithubUploader;
pub use notifier::WebhookNotifier;
pub use probe::HttpProbe;
