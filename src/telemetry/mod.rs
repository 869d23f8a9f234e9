pub mod sink;

use crate::device::DeviceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use sink::{LoggingSink, MemorySink, TelemetrySink};

/// 单块算力板数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub index: u32,
    /// GH/s
    pub hashrate: f64,
    pub temperature: f64,
    pub chip_temperature: f64,
    /// MHz
    pub frequency: f64,
    /// mV
    pub voltage: f64,
    /// W
    pub power: f64,
    pub chip_count: u32,
    pub hardware_errors: u64,
}

/// 集群主机汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    /// GH/s
    pub total_hashrate: f64,
    pub total_power: f64,
    pub total_efficiency: f64,
    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub active_members: u32,
}

/// 归一化遥测快照
///
/// 每次轮询新建，不在设备间共享。所有数值字段都已从厂商格式转换完毕。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub vendor: DeviceType,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub model: String,
    pub algorithm: String,
    pub firmware_version: String,

    /// GH/s
    pub hashrate: f64,
    /// 最高温度（摄氏度）
    pub temperature: f64,
    pub vr_temperature: f64,
    /// W
    pub power: f64,
    /// J/TH
    pub efficiency: f64,
    /// A
    pub current: f64,
    /// MHz
    pub frequency: f64,
    /// mV
    pub voltage: f64,
    /// 百分比
    pub fan_speed: f64,
    pub fan_rpm: f64,
    pub uptime_seconds: u64,

    pub accepted_shares: u64,
    pub rejected_shares: u64,
    pub best_difficulty: f64,
    pub best_session_difficulty: f64,
    pub pool_difficulty: f64,

    pub pool_url: String,
    pub pool_host: String,
    pub pool_port: u16,
    pub pool_user: String,

    pub boards: Vec<BoardSnapshot>,
    pub cluster: Option<ClusterSummary>,
    /// 原始厂商数据，供审计
    pub raw: Value,
}

impl TelemetrySnapshot {
    pub fn new(vendor: DeviceType) -> Self {
        Self {
            vendor,
            timestamp: Utc::now(),
            hostname: String::new(),
            model: String::new(),
            algorithm: String::new(),
            firmware_version: String::new(),
            hashrate: 0.0,
            temperature: 0.0,
            vr_temperature: 0.0,
            power: 0.0,
            efficiency: 0.0,
            current: 0.0,
            frequency: 0.0,
            voltage: 0.0,
            fan_speed: 0.0,
            fan_rpm: 0.0,
            uptime_seconds: 0,
            accepted_shares: 0,
            rejected_shares: 0,
            best_difficulty: 0.0,
            best_session_difficulty: 0.0,
            pool_difficulty: 0.0,
            pool_url: String::new(),
            pool_host: String::new(),
            pool_port: 0,
            pool_user: String::new(),
            boards: Vec::new(),
            cluster: None,
            raw: Value::Null,
        }
    }

    /// 拒绝率（百分比）
    pub fn reject_rate(&self) -> f64 {
        let total = self.accepted_shares + self.rejected_shares;
        if total == 0 {
            0.0
        } else {
            self.rejected_shares as f64 / total as f64 * 100.0
        }
    }
}

/// 能效 J/TH，算力为零时返回 0
pub fn efficiency_j_per_th(power: f64, hashrate_gh: f64) -> f64 {
    let th = hashrate_gh / 1000.0;
    if th > 0.0 && power > 0.0 {
        power / th
    } else {
        0.0
    }
}

/// 拆分矿池地址为主机与端口，先去掉 `scheme://` 前缀
pub fn split_pool_url(url: &str) -> (String, u16) {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return (String::new(), 0);
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("stratum+tcp://{}", trimmed)
    };

    match url::Url::parse(&with_scheme) {
        Ok(parsed) => (
            parsed.host_str().unwrap_or_default().to_string(),
            parsed.port().unwrap_or(0),
        ),
        Err(_) => {
            let rest = trimmed.split("://").last().unwrap_or(trimmed);
            match rest.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.trim_end_matches('/').parse().unwrap_or(0)),
                None => (rest.to_string(), 0),
            }
        }
    }
}
