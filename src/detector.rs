//! 设备类型识别
//!
//! 按固定优先级 HTTP-JSON → HTTP-Digest → CGMiner 逐个尝试，第一个成功拉取到
//! 快照的适配器决定类型。

use crate::adapters::AdapterSet;
use crate::device::{Credentials, DeviceType};
use crate::telemetry::TelemetrySnapshot;
use tracing::{debug, info};

/// 识别结果
#[derive(Debug, Clone)]
pub enum DetectionOutcome {
    /// 识别成功，附带识别时拉取的快照
    Detected {
        device_type: DeviceType,
        snapshot: Box<TelemetrySnapshot>,
    },
    /// 设备存在但需要凭据
    NeedsCredentials { device_type: DeviceType },
    NotFound,
}

impl DetectionOutcome {
    pub fn device_type(&self) -> Option<DeviceType> {
        match self {
            DetectionOutcome::Detected { device_type, .. }
            | DetectionOutcome::NeedsCredentials { device_type } => Some(*device_type),
            DetectionOutcome::NotFound => None,
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, DetectionOutcome::Detected { .. })
    }
}

/// 设备类型识别器
#[derive(Clone)]
pub struct DeviceDetector {
    adapters: AdapterSet,
}

impl DeviceDetector {
    pub fn new(adapters: AdapterSet) -> Self {
        Self { adapters }
    }

    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// 轮询重新识别用：认证错误不终止，继续尝试后续协议
    pub async fn detect(&self, address: &str, credentials: Option<&Credentials>) -> DetectionOutcome {
        self.run(address, credentials, false).await
    }

    /// 发现扫描用：第一个肯定应答即结束，认证错误也算设备已确认
    pub async fn detect_first_match(&self, address: &str, credentials: Option<&Credentials>) -> DetectionOutcome {
        self.run(address, credentials, true).await
    }

    async fn run(&self, address: &str, credentials: Option<&Credentials>, stop_on_auth: bool) -> DetectionOutcome {
        let mut auth_type = None;

        for adapter in self.adapters.in_detection_order() {
            let device_type = adapter.device_type();
            match adapter.fetch(address, credentials).await {
                Ok(snapshot) => {
                    info!("🔍 {} identified as {}", address, device_type);
                    return DetectionOutcome::Detected {
                        device_type,
                        snapshot: Box::new(snapshot),
                    };
                }
                Err(e) if e.is_auth_error() => {
                    debug!("{} answered as {} but needs credentials: {}", address, device_type, e);
                    auth_type.get_or_insert(device_type);
                    if stop_on_auth {
                        break;
                    }
                }
                Err(e) => {
                    debug!("{} is not {}: {}", address, device_type, e);
                }
            }
        }

        if auth_type.is_none() {
            for adapter in self.adapters.in_detection_order() {
                if adapter.requires_authentication(address).await {
                    auth_type = Some(adapter.device_type());
                    break;
                }
            }
        }

        match auth_type {
            Some(device_type) => DetectionOutcome::NeedsCredentials { device_type },
            None => DetectionOutcome::NotFound,
        }
    }
}
