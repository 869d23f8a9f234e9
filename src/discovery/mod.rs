//! 局域网矿机发现
//!
//! 枚举本机非回环 IPv4 接口所在的 /24 网段，分批并发探测，每批结束后
//! 汇报进度并检查取消标记。取消是协作式的，已发出的一批探测会跑完。

use crate::adapters::AdapterSet;
use crate::config::{AdaptersConfig, DiscoveryConfig};
use crate::detector::{DetectionOutcome, DeviceDetector};
use crate::device::DeviceType;
use crate::error::DiscoveryError;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// 扫描进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub scanned: usize,
    pub total: usize,
    pub found: usize,
    pub cancelled: bool,
}

/// 发现的候选设备
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub address: String,
    pub device_type: DeviceType,
    /// 设备应答了但需要凭据
    pub requires_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// GH/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashrate: Option<f64>,
}

impl DiscoveredDevice {
    fn from_outcome(address: &str, outcome: DetectionOutcome) -> Option<Self> {
        match outcome {
            DetectionOutcome::Detected { device_type, snapshot } => Some(Self {
                address: address.to_string(),
                device_type,
                requires_auth: false,
                hostname: non_empty(&snapshot.hostname),
                model: non_empty(&snapshot.model),
                hashrate: Some(snapshot.hashrate),
            }),
            DetectionOutcome::NeedsCredentials { device_type } => Some(Self {
                address: address.to_string(),
                device_type,
                requires_auth: true,
                hostname: None,
                model: None,
                hashrate: None,
            }),
            DetectionOutcome::NotFound => None,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// 一个地址所在 /24 的全部主机地址（.1 到 .254）
pub fn subnet_hosts(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254).map(|d| Ipv4Addr::new(a, b, c, d)).collect()
}

/// 多个接口地址展开并去重，同一 /24 只展开一次
pub fn hosts_for_interfaces(ips: impl IntoIterator<Item = Ipv4Addr>) -> Vec<String> {
    let prefixes: BTreeSet<[u8; 3]> = ips
        .into_iter()
        .map(|ip| {
            let [a, b, c, _] = ip.octets();
            [a, b, c]
        })
        .collect();

    prefixes
        .into_iter()
        .flat_map(|[a, b, c]| subnet_hosts(Ipv4Addr::new(a, b, c, 0)))
        .map(|ip| ip.to_string())
        .collect()
}

/// 本机非回环 IPv4 接口地址
pub fn local_ipv4_addresses() -> Result<Vec<Ipv4Addr>, DiscoveryError> {
    let interfaces = get_if_addrs::get_if_addrs().map_err(|e| DiscoveryError::Interfaces {
        error: e.to_string(),
    })?;

    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            get_if_addrs::IfAddr::V4(v4) if !v4.ip.is_link_local() => Some(v4.ip),
            _ => None,
        })
        .collect())
}

/// 扫描进行中标记，离开作用域时清除
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 发现扫描器，同一时间只允许一个扫描
pub struct DiscoveryScanner {
    detector: DeviceDetector,
    concurrency: usize,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl DiscoveryScanner {
    pub fn new(detector: DeviceDetector, concurrency: usize) -> Self {
        Self {
            detector,
            concurrency: concurrency.max(1),
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// 探测用适配器使用统一的短超时
    pub fn from_config(adapters: &AdaptersConfig, discovery: &DiscoveryConfig) -> Self {
        let adapters = AdapterSet::for_probing(adapters, discovery.probe_timeout());
        Self::new(DeviceDetector::new(adapters), discovery.concurrency)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 请求取消当前扫描，在当前批次结束后生效
    pub fn cancel(&self) {
        if self.is_running() {
            info!("Discovery cancellation requested");
        }
        self.cancelled.store(true, Ordering::Release);
    }

    /// 扫描本机所有 /24 网段
    pub async fn discover_devices<F>(&self, on_progress: F) -> Result<Vec<DiscoveredDevice>, DiscoveryError>
    where
        F: FnMut(DiscoveryProgress),
    {
        let local = local_ipv4_addresses()?;
        if local.is_empty() {
            return Err(DiscoveryError::NoSubnets);
        }
        info!("📡 Scanning subnets of {:?}", local);
        self.scan_addresses(hosts_for_interfaces(local), on_progress).await
    }

    /// 分批探测给定地址
    pub async fn scan_addresses<F>(
        &self,
        addresses: Vec<String>,
        mut on_progress: F,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError>
    where
        F: FnMut(DiscoveryProgress),
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        self.cancelled.store(false, Ordering::Release);

        let total = addresses.len();
        let mut found = Vec::new();
        let mut scanned = 0;

        for batch in addresses.chunks(self.concurrency) {
            let outcomes = join_all(batch.iter().map(|address| self.detector.detect_first_match(address, None))).await;

            for (address, outcome) in batch.iter().zip(outcomes) {
                if let Some(device) = DiscoveredDevice::from_outcome(address, outcome) {
                    info!(
                        target: "discovery",
                        "Found {} at {}{}",
                        device.device_type,
                        device.address,
                        if device.requires_auth { " (needs credentials)" } else { "" }
                    );
                    found.push(device);
                }
            }
            scanned += batch.len();

            let mut progress = DiscoveryProgress {
                scanned,
                total,
                found: found.len(),
                cancelled: self.cancelled.load(Ordering::Acquire),
            };
            on_progress(progress);

            // 回调里也可能发出取消
            if self.cancelled.load(Ordering::Acquire) {
                if !progress.cancelled {
                    progress.cancelled = true;
                    on_progress(progress);
                }
                info!("Discovery cancelled after {}/{} addresses", scanned, total);
                break;
            }
        }

        debug!("Discovery finished: {} devices in {} addresses", found.len(), scanned);
        Ok(found)
    }
}
