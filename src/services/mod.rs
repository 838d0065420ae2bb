//! 服务层模块
//!
//! 备份、crontab、进程管理器、修复流程与看门狗

pub mod backup;
pub mod cron;
pub mod repair;
pub mod supervisor;
pub mod watchdog;
