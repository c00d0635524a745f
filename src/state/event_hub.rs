//! 进度事件通道管理
//!
//! 每个 run 一条广播通道，零或多个订阅者；投递尽力而为，
//! 掉线或滞后的订阅者既不会阻塞也不会拖垮 run

use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::config::constants::EVENT_CHANNEL_CAPACITY;
use crate::domain::deploy::ProgressEvent;

/// 通道信息
struct EventChannel {
    sender: broadcast::Sender<ProgressEvent>,
    finished: bool,
}

/// 进度事件中心
pub struct EventHub {
    channels: RwLock<HashMap<String, EventChannel>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 为 run 创建通道；已存在时返回现有发送端
    pub async fn create(&self, run_id: &str) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(run_id) {
            return channel.sender.clone();
        }
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        channels.insert(
            run_id.to_string(),
            EventChannel {
                sender: sender.clone(),
                finished: false,
            },
        );
        sender
    }

    /// 订阅 run 的进度事件；通道不存在时返回 None
    pub async fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        let channels = self.channels.read().await;
        channels.get(run_id).map(|c| c.sender.subscribe())
    }

    pub async fn get_sender(&self, run_id: &str) -> Option<broadcast::Sender<ProgressEvent>> {
        let channels = self.channels.read().await;
        channels.get(run_id).map(|c| c.sender.clone())
    }

    /// 标记通道完成，订阅者收尾后即可清理
    pub async fn finish(&self, run_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(run_id) {
            channel.finished = true;
        }
    }

    pub async fn is_finished(&self, run_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(run_id).map_or(true, |c| c.finished)
    }

    /// 清理已完成且无活跃订阅者的通道
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, channel| !channel.finished || channel.sender.receiver_count() > 0);
    }

    pub async fn count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// 进度报告器
///
/// 绑定单个 run 的便捷发射器，传给各阶段组件使用；
/// 没有订阅者时事件被丢弃，但仍会进入结构化日志
#[derive(Clone)]
pub struct ProgressReporter {
    run_id: String,
    sender: Option<broadcast::Sender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn new(run_id: impl Into<String>, sender: broadcast::Sender<ProgressEvent>) -> Self {
        Self {
            run_id: run_id.into(),
            sender: Some(sender),
        }
    }

    /// 无通道的报告器（只写日志）
    pub fn detached(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            sender: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 发射一条进度事件
    pub fn emit(&self, phase_or_status: &str, message: impl Into<String>) {
        let message = message.into();
        info!(run_id = %self.run_id, stage = %phase_or_status, "{}", message);
        if let Some(ref sender) = self.sender {
            let _ = sender.send(ProgressEvent::new(&self.run_id, phase_or_status, message));
        }
    }
}
