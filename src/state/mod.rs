//! 运行时状态模块
//!
//! 应用状态、修复任务存储和日志通道

pub mod app_state;
pub mod log_hub;
pub mod task_store;

pub use app_state::{get_shutdown_token, trigger_shutdown, AppState, RunningRepair};
pub use log_hub::LogHub;
pub use task_store::TaskStore;
