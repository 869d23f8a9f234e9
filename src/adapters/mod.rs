//! 协议适配器
//!
//! 每个适配器把一种厂商接口映射为统一的 [`TelemetrySnapshot`]：
//! - [`HttpJsonAdapter`]：自研固件的 HTTP/JSON 接口
//! - [`HttpDigestAdapter`]：需要 Digest 认证的老款 ASIC CGI 接口
//! - [`CgminerTcpAdapter`]：CGMiner TCP 行协议

pub mod cgminer_tcp;
pub mod fields;
pub mod http_digest;
pub mod http_json;

use crate::config::AdaptersConfig;
use crate::device::{Credentials, DeviceType};
use crate::error::FetchError;
use crate::telemetry::TelemetrySnapshot;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use cgminer_tcp::CgminerTcpAdapter;
pub use http_digest::HttpDigestAdapter;
pub use http_json::HttpJsonAdapter;

/// 协议适配器特征
///
/// `fetch` 不会 panic，所有失败都以 [`FetchError`] 返回并记录原因。
#[async_trait]
pub trait MinerAdapter: Send + Sync {
    /// 适配器对应的协议族
    fn device_type(&self) -> DeviceType;

    /// 拉取一次遥测数据
    async fn fetch(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Result<TelemetrySnapshot, FetchError>;

    /// 不带凭据探测设备是否要求认证
    async fn requires_authentication(&self, _address: &str) -> bool {
        false
    }
}

/// 按协议族索引的适配器集合
#[derive(Clone)]
pub struct AdapterSet {
    adapters: Vec<Arc<dyn MinerAdapter>>,
}

impl AdapterSet {
    pub fn new(adapters: Vec<Arc<dyn MinerAdapter>>) -> Self {
        Self { adapters }
    }

    /// 轮询用的适配器，超时按协议族分别配置
    pub fn from_config(config: &AdaptersConfig) -> Self {
        Self::new(vec![
            Arc::new(HttpJsonAdapter::new(Duration::from_millis(config.http_json_timeout_ms))),
            Arc::new(HttpDigestAdapter::new(Duration::from_millis(config.http_digest_timeout_ms))),
            Arc::new(CgminerTcpAdapter::from_config(config)),
        ])
    }

    /// 发现扫描用的适配器，统一使用较短的探测超时
    pub fn for_probing(config: &AdaptersConfig, probe_timeout: Duration) -> Self {
        let mut tcp = config.clone();
        tcp.cgminer_timeout_ms = probe_timeout.as_millis() as u64;
        Self::new(vec![
            Arc::new(HttpJsonAdapter::new(probe_timeout)),
            Arc::new(HttpDigestAdapter::new(probe_timeout)),
            Arc::new(CgminerTcpAdapter::from_config(&tcp)),
        ])
    }

    pub fn get(&self, device_type: DeviceType) -> Option<Arc<dyn MinerAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.device_type() == device_type)
            .cloned()
    }

    /// 按识别优先级排序：HTTP-JSON、HTTP-Digest、CGMiner
    pub fn in_detection_order(&self) -> Vec<Arc<dyn MinerAdapter>> {
        DeviceType::DETECTION_ORDER
            .iter()
            .filter_map(|t| self.get(*t))
            .collect()
    }
}
