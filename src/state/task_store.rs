//! 任务存储
//!
//! 运行中的修复任务与历史记录，历史按条数和保留时间清理

use chrono::{Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::config::env::constants::MAX_TASK_HISTORY;
use crate::domain::repair::{RepairStage, RepairStatus, RepairTask};
use crate::domain::supervisor::SupervisorKind;

pub struct TaskStore {
    /// 运行中的任务
    tasks: RwLock<HashMap<String, RepairTask>>,
    /// 已完成任务，最新在前
    history: RwLock<VecDeque<RepairTask>>,
    max_history: usize,
    retention: Duration,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::with_config(MAX_TASK_HISTORY, 24 * 7)
    }

    /// 使用自定义配置创建
    pub fn with_config(max_history: usize, retention_hours: i64) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
            retention: Duration::hours(retention_hours),
        }
    }

    pub async fn create(&self, task: RepairTask) -> String {
        let task_id = task.id.clone();
        self.tasks.write().await.insert(task_id.clone(), task);
        task_id
    }

    /// 获取运行中的任务
    pub async fn get(&self, task_id: &str) -> Option<RepairTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 获取任务（先查运行中，再查历史）
    pub async fn get_any(&self, task_id: &str) -> Option<RepairTask> {
        if let Some(task) = self.get(task_id).await {
            return Some(task);
        }
        let history = self.history.read().await;
        history.iter().find(|t| t.id == task_id).cloned()
    }

    pub async fn update_stages(&self, task_id: &str, stages: Vec<RepairStage>) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.stages = stages;
        }
    }

    /// 记录拉起 n8n 的进程管理器
    pub async fn set_supervisor(&self, task_id: &str, kind: SupervisorKind) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            task.supervisor = Some(kind);
        }
    }

    /// 完成任务并移到历史记录
    pub async fn finish(&self, task_id: &str, status: RepairStatus, exit_code: Option<i32>) {
        let task = self.tasks.write().await.remove(task_id);
        if let Some(mut task) = task {
            task.complete(status, exit_code);
            self.add_to_history(task).await;
        }
    }

    pub async fn add_to_history(&self, task: RepairTask) {
        let mut history = self.history.write().await;
        history.push_front(task);
        while history.len() > self.max_history {
            history.pop_back();
        }
    }

    /// 最近的任务，可按状态过滤
    pub async fn recent(&self, limit: usize, status: Option<&str>) -> Vec<RepairTask> {
        let running: Vec<RepairTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| status.map_or(true, |s| task.status.as_str() == s))
            .cloned()
            .collect();

        let history = self.history.read().await;
        running
            .into_iter()
            .chain(
                history
                    .iter()
                    .filter(|task| status.map_or(true, |s| task.status.as_str() == s))
                    .cloned(),
            )
            .take(limit)
            .collect()
    }

    pub async fn history_count(&self) -> usize {
        self.history.read().await.len()
    }

    /// 移除超过保留时间的历史记录
    pub async fn cleanup_stale(&self) {
        let cutoff = Utc::now() - self.retention;
        self.history
            .write()
            .await
            .retain(|task| task.finished_at.map_or(true, |t| t > cutoff));
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repair::RepairTrigger;

    #[tokio::test]
    async fn test_task_lifecycle() {
        let store = TaskStore::new();
        store
            .create(RepairTask::new("task-1".to_string(), RepairTrigger::Api))
            .await;
        store.set_supervisor("task-1", SupervisorKind::Pm2).await;

        let running = store.recent(10, Some("running")).await;
        assert_eq!(running.len(), 1);

        store.finish("task-1", RepairStatus::Success, Some(0)).await;
        assert!(store.get("task-1").await.is_none());

        let task = store.get_any("task-1").await.unwrap();
        assert_eq!(task.status, RepairStatus::Success);
        assert_eq!(task.exit_code, Some(0));
        assert_eq!(task.supervisor, Some(SupervisorKind::Pm2));
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_history_limit_and_filter() {
        let store = TaskStore::with_config(5, 24);

        for i in 0..10 {
            let mut task = RepairTask::new(format!("task-{}", i), RepairTrigger::Watchdog);
            let status = if i % 2 == 0 { RepairStatus::Success } else { RepairStatus::Failed };
            task.complete(status, Some(0));
            store.add_to_history(task).await;
        }

        assert_eq!(store.history_count().await, 5);
        let recent = store.recent(10, None).await;
        assert_eq!(recent[0].id, "task-9");

        let failed = store.recent(10, Some("failed")).await;
        assert!(failed.iter().all(|t| t.status == RepairStatus::Failed));
        assert_eq!(failed.len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let store = TaskStore::with_config(10, 1);
        let mut old = RepairTask::new("old".to_string(), RepairTrigger::Manual);
        old.complete(RepairStatus::Success, Some(0));
        old.finished_at = Some(Utc::now() - Duration::hours(2));
        store.add_to_history(old).await;

        store.cleanup_stale().await;
        assert_eq!(store.history_count().await, 0);
    }
}
