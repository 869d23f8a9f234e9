use super::{Credentials, Device, DeviceId, DeviceType};
use crate::error::RegistryError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// 设备注册表
///
/// 持久化的设备记录由外部维护，监控核心只通过这几个操作读写。
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// 获取单个设备
    async fn get_device(&self, id: DeviceId) -> Result<Device, RegistryError>;

    /// 列出全部设备
    async fn list_devices(&self) -> Result<Vec<Device>, RegistryError>;

    /// 修改设备协议族与凭据
    async fn set_device_type(
        &self,
        id: DeviceId,
        device_type: DeviceType,
        credentials: Option<Credentials>,
    ) -> Result<(), RegistryError>;

    /// 设置在线状态
    async fn set_online(&self, id: DeviceId, online: bool) -> Result<(), RegistryError>;

    /// 记录最佳难度，严格大于历史值时返回 `true`
    async fn record_best_difficulty(&self, id: DeviceId, value: f64) -> Result<bool, RegistryError>;
}

/// 内存注册表
#[derive(Default)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let devices = devices.into_iter().map(|d| (d.id, d)).collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// 添加或替换设备
    pub async fn upsert(&self, device: Device) {
        self.devices.write().await.insert(device.id, device);
    }

    pub async fn remove(&self, id: DeviceId) -> Option<Device> {
        self.devices.write().await.remove(&id)
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn get_device(&self, id: DeviceId) -> Result<Device, RegistryError> {
        self.devices
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound { device_id: id })
    }

    async fn list_devices(&self) -> Result<Vec<Device>, RegistryError> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn set_device_type(
        &self,
        id: DeviceId,
        device_type: DeviceType,
        credentials: Option<Credentials>,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound { device_id: id })?;
        debug!("Device {} type {} -> {}", id, device.device_type, device_type);
        device.device_type = device_type;
        device.credentials = credentials;
        Ok(())
    }

    async fn set_online(&self, id: DeviceId, online: bool) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound { device_id: id })?;
        device.online = online;
        if online {
            device.last_seen = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_best_difficulty(&self, id: DeviceId, value: f64) -> Result<bool, RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(&id).ok_or(RegistryError::NotFound { device_id: id })?;
        if value > device.best_difficulty {
            device.best_difficulty = value;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
