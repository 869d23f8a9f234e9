//! 监控事件分发
//!
//! 订阅者各持一个无界通道，发送时移除已关闭的订阅者，存活的订阅者不会丢事件。

use crate::device::DeviceId;
use crate::telemetry::TelemetrySnapshot;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// 监控事件
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// 拉取成功
    Snapshot {
        device_id: DeviceId,
        snapshot: Arc<TelemetrySnapshot>,
    },
    /// 在线状态变化，离线时没有快照
    StatusChanged {
        device_id: DeviceId,
        online: bool,
        snapshot: Option<Arc<TelemetrySnapshot>>,
        timestamp: DateTime<Utc>,
    },
    /// 最佳难度刷新纪录
    NewRecord {
        device_id: DeviceId,
        difficulty: f64,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    pub fn device_id(&self) -> DeviceId {
        match self {
            MonitorEvent::Snapshot { device_id, .. }
            | MonitorEvent::StatusChanged { device_id, .. }
            | MonitorEvent::NewRecord { device_id, .. } => *device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MonitorEvent::Snapshot { snapshot, .. } => snapshot.timestamp,
            MonitorEvent::StatusChanged { timestamp, .. } => *timestamp,
            MonitorEvent::NewRecord { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件总线
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<MonitorEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    pub fn emit(&self, event: MonitorEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!("Event for device {} delivered to {} subscribers", event.device_id(), subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
