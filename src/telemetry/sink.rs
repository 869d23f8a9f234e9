use super::TelemetrySnapshot;
use crate::device::DeviceId;
use crate::error::SinkError;
use crate::utils::format_difficulty;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// 遥测数据落地接口，存储与保留策略由实现方决定
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn store(&self, device_id: DeviceId, snapshot: &TelemetrySnapshot) -> Result<(), SinkError>;
}

/// 内存存储，按设备保留最近若干条快照
pub struct MemorySink {
    capacity: usize,
    snapshots: RwLock<HashMap<DeviceId, Vec<TelemetrySnapshot>>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    pub async fn snapshots(&self, device_id: DeviceId) -> Vec<TelemetrySnapshot> {
        self.snapshots
            .read()
            .await
            .get(&device_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, device_id: DeviceId) -> usize {
        self.snapshots
            .read()
            .await
            .get(&device_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn store(&self, device_id: DeviceId, snapshot: &TelemetrySnapshot) -> Result<(), SinkError> {
        let mut snapshots = self.snapshots.write().await;
        let history = snapshots.entry(device_id).or_default();
        history.push(snapshot.clone());
        if history.len() > self.capacity {
            let excess = history.len() - self.capacity;
            history.drain(..excess);
        }
        Ok(())
    }
}

/// 只写日志的存储，命令行 watch 模式使用
#[derive(Debug, Default)]
pub struct LoggingSink;

impl LoggingSink {
    /// 单行摘要：算力 | 温度 | 功耗 | 份额 | 最佳难度
    pub fn summary(snapshot: &TelemetrySnapshot) -> String {
        format!(
            "{} | {} | {} | A:{} R:{} | best {}",
            crate::hashrate!(snapshot.hashrate),
            crate::temperature_display!(snapshot.temperature),
            crate::power_display!(snapshot.power),
            snapshot.accepted_shares,
            snapshot.rejected_shares,
            format_difficulty(snapshot.best_difficulty)
        )
    }
}

#[async_trait]
impl TelemetrySink for LoggingSink {
    async fn store(&self, device_id: DeviceId, snapshot: &TelemetrySnapshot) -> Result<(), SinkError> {
        info!(
            target: "device",
            device_id,
            vendor = %snapshot.vendor,
            model = %snapshot.model,
            "{}",
            Self::summary(snapshot)
        );
        Ok(())
    }
}
