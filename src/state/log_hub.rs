//! 修复日志广播
//!
//! 每个修复任务一个 broadcast 通道，SSE 订阅者从这里读取日志。
//! 任务结束后通道标记完成，没有订阅者时由清理任务回收。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::domain::repair::LogLine;

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

struct LogChannel {
    sender: broadcast::Sender<LogLine>,
    /// 完成时间，None 表示任务仍在运行
    finished_at: Option<DateTime<Utc>>,
}

pub struct LogHub {
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建通道，已存在时返回现有发送者
    pub async fn create(&self, task_id: &str) -> broadcast::Sender<LogLine> {
        let mut channels = self.channels.write().await;
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| LogChannel {
                sender: broadcast::channel(LOG_CHANNEL_CAPACITY).0,
                finished_at: None,
            })
            .sender
            .clone()
    }

    pub async fn subscribe(&self, task_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        let channels = self.channels.read().await;
        channels.get(task_id).map(|c| c.sender.subscribe())
    }

    pub async fn get_sender(&self, task_id: &str) -> Option<broadcast::Sender<LogLine>> {
        let channels = self.channels.read().await;
        channels.get(task_id).map(|c| c.sender.clone())
    }

    /// 标记通道完成，SSE 客户端随后收到 complete 事件
    pub async fn finish(&self, task_id: &str) {
        if let Some(channel) = self.channels.write().await.get_mut(task_id) {
            channel.finished_at.get_or_insert_with(Utc::now);
        }
    }

    /// 不存在的通道视为已完成
    pub async fn is_finished(&self, task_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(task_id).map_or(true, |c| c.finished_at.is_some())
    }

    pub async fn exists(&self, task_id: &str) -> bool {
        self.channels.read().await.contains_key(task_id)
    }

    /// 回收已完成且没有订阅者的通道；完成超过 `max_age_hours` 的一律回收
    pub async fn cleanup(&self, max_age_hours: i64) {
        let now = Utc::now();
        self.channels.write().await.retain(|_, channel| match channel.finished_at {
            None => true,
            Some(at) if (now - at).num_hours() >= max_age_hours => false,
            Some(_) => channel.sender.receiver_count() > 0,
        });
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
