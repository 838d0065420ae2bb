//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod backup;
pub mod cron;
pub mod health;
pub mod repair;
pub mod supervisor;
pub mod system;

// Re-exports for convenience
pub use backup::{BackupEntry, GlobPattern, RetentionPlan};
pub use cron::{CronJob, CronSchedule, CronTable, ManagedJob};
pub use health::{AcceptedStatuses, ProbeOutcome, ProbeReport, ProbeSettings};
pub use repair::{LogLine, RepairOptions, RepairStage, RepairStatus, RepairTask, RepairTrigger, StageStatus};
pub use supervisor::{ServiceState, SupervisorKind, SupervisorStatus};
pub use system::{DiskInfo, LoadAverage, SystemStats};
