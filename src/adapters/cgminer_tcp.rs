use super::fields::{count, difficulty, number, text};
use super::http_digest::is_fan_slot;
use super::MinerAdapter;
use crate::config::AdaptersConfig;
use crate::device::{Credentials, DeviceType};
use crate::error::FetchError;
use crate::protocol::CgminerClient;
use crate::telemetry::{efficiency_j_per_th, split_pool_url, TelemetrySnapshot};
use crate::utils::units::number_from_value;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

/// 一次请求取回汇总、矿池和统计
pub const STATUS_COMMAND: &str = "summary+pools+stats";
pub const VERSION_COMMAND: &str = "version";

/// 缺少功耗读数时按能效估算（J/TH）
pub const DEFAULT_JOULES_PER_TH: f64 = 34.0;

pub const FALLBACK_MODEL: &str = "CGMiner Device";

const MHS_KEYS: &[&str] = &["MHS 5s", "MHS av", "MHS 1m"];
const GHS_KEYS: &[&str] = &["GHS 5s", "GHS av"];
const ACCEPTED_KEYS: &[&str] = &["Accepted"];
const REJECTED_KEYS: &[&str] = &["Rejected"];
const BEST_SHARE_KEYS: &[&str] = &["Best Share"];
const ELAPSED_KEYS: &[&str] = &["Elapsed"];

const POOL_URL_KEYS: &[&str] = &["URL"];
const POOL_USER_KEYS: &[&str] = &["User"];
const POOL_DIFF_KEYS: &[&str] = &["Stratum Difficulty", "Last Share Difficulty", "Diff"];

/// CGMiner 响应中的命名段
#[derive(Debug, Default)]
pub struct CgminerSections {
    pub summary: Vec<Value>,
    pub pools: Vec<Value>,
    pub stats: Vec<Value>,
    pub version: Vec<Value>,
}

impl CgminerSections {
    /// 从解析出的对象中收集各段
    ///
    /// 多命令请求会把每段包在小写键里（`{"summary":[{...,"SUMMARY":[...]}]}`），
    /// 单命令则直接返回大写段。两种形式都接受。
    pub fn collect(values: &[Value]) -> Self {
        let mut sections = Self::default();
        for value in values {
            sections.absorb(value);
        }
        sections
    }

    fn absorb(&mut self, value: &Value) {
        let Some(map) = value.as_object() else {
            return;
        };

        for (key, inner) in map {
            match key.as_str() {
                "SUMMARY" => extend_section(&mut self.summary, inner),
                "POOLS" => extend_section(&mut self.pools, inner),
                "STATS" => extend_section(&mut self.stats, inner),
                "VERSION" => extend_section(&mut self.version, inner),
                "summary" | "pools" | "stats" | "version" => match inner {
                    Value::Array(items) => items.iter().for_each(|item| self.absorb(item)),
                    Value::Object(_) => self.absorb(inner),
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

fn extend_section(target: &mut Vec<Value>, value: &Value) {
    match value {
        Value::Array(items) => target.extend(items.iter().filter(|v| v.is_object()).cloned()),
        Value::Object(_) => target.push(value.clone()),
        _ => {}
    }
}

/// CGMiner TCP 适配器
pub struct CgminerTcpAdapter {
    client: CgminerClient,
    joules_per_th: f64,
}

impl Default for CgminerTcpAdapter {
    fn default() -> Self {
        Self::new(CgminerClient::default(), DEFAULT_JOULES_PER_TH)
    }
}

impl CgminerTcpAdapter {
    pub fn new(client: CgminerClient, joules_per_th: f64) -> Self {
        Self { client, joules_per_th }
    }

    pub fn from_config(config: &AdaptersConfig) -> Self {
        let client = CgminerClient::new(
            config.cgminer_port,
            Duration::from_millis(config.cgminer_timeout_ms),
            Duration::from_millis(config.cgminer_idle_timeout_ms),
        );
        Self::new(client, config.cgminer_joules_per_th)
    }

    async fn fetch_snapshot(&self, address: &str) -> Result<TelemetrySnapshot, FetchError> {
        let values = self.client.query(address, STATUS_COMMAND).await?;
        let mut sections = CgminerSections::collect(&values);

        if sections.summary.is_empty() {
            return Err(FetchError::ProtocolMismatch {
                address: address.to_string(),
                reason: "no SUMMARY section in CGMiner response".to_string(),
            });
        }

        if sections.version.is_empty() {
            match self.client.query(address, VERSION_COMMAND).await {
                Ok(values) => sections.version = CgminerSections::collect(&values).version,
                Err(e) => debug!("CGMiner version unavailable for {}: {}", address, e),
            }
        }

        let mut snapshot = build_snapshot(&sections, self.joules_per_th);
        if snapshot.hostname.is_empty() {
            snapshot.hostname = address.to_string();
        }
        snapshot.raw = json!({
            "summary": sections.summary,
            "pools": sections.pools,
            "stats": sections.stats,
            "version": sections.version,
        });
        Ok(snapshot)
    }
}

#[async_trait]
impl MinerAdapter for CgminerTcpAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::CgminerTcp
    }

    async fn fetch(
        &self,
        address: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<TelemetrySnapshot, FetchError> {
        let result = self.fetch_snapshot(address).await;
        if let Err(e) = &result {
            debug!("CGMiner fetch failed for {}: {}", address, e);
        }
        result
    }
}

/// 汇总段算力：MHS 换算为 GH/s，GHS 直接使用
pub fn summary_hashrate_gh(summary: &Value) -> f64 {
    let mhs = number(summary, MHS_KEYS);
    if mhs > 0.0 {
        return mhs / 1000.0;
    }
    number(summary, GHS_KEYS)
}

fn is_temperature_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.contains("temp") && !lower.ends_with("num")
}

/// 由各段构造快照，不包含原始数据
pub fn build_snapshot(sections: &CgminerSections, joules_per_th: f64) -> TelemetrySnapshot {
    let mut snapshot = TelemetrySnapshot::new(DeviceType::CgminerTcp);
    snapshot.algorithm = "SHA-256".to_string();

    if let Some(summary) = sections.summary.first() {
        snapshot.hashrate = summary_hashrate_gh(summary);
        snapshot.accepted_shares = count(summary, ACCEPTED_KEYS);
        snapshot.rejected_shares = count(summary, REJECTED_KEYS);
        snapshot.best_difficulty = difficulty(summary, BEST_SHARE_KEYS);
        snapshot.uptime_seconds = count(summary, ELAPSED_KEYS);
    }

    // 第一个矿池视为当前矿池（CGMiner 按优先级排序）
    if let Some(pool) = sections.pools.first() {
        snapshot.pool_url = text(pool, POOL_URL_KEYS);
        let (host, port) = split_pool_url(&snapshot.pool_url);
        snapshot.pool_host = host;
        snapshot.pool_port = port;
        snapshot.pool_user = text(pool, POOL_USER_KEYS);
        snapshot.pool_difficulty = difficulty(pool, POOL_DIFF_KEYS);
    }

    let mut max_temperature: f64 = 0.0;
    let mut max_fan: f64 = 0.0;
    let mut model = String::new();

    for entry in &sections.stats {
        let Some(map) = entry.as_object() else {
            continue;
        };
        if model.is_empty() {
            model = text(entry, &["Type"]);
        }
        max_temperature = max_temperature.max(scan_max(map, is_temperature_key));
        max_fan = max_fan.max(scan_max(map, is_fan_slot));
    }

    snapshot.temperature = max_temperature;
    snapshot.fan_rpm = max_fan;
    snapshot.model = if model.is_empty() {
        FALLBACK_MODEL.to_string()
    } else {
        model
    };

    if let Some(version) = sections.version.first() {
        snapshot.firmware_version = text(version, &["CGMiner", "BMMiner", "Miner"]);
    }

    snapshot.power = snapshot.hashrate / 1000.0 * joules_per_th;
    snapshot.efficiency = efficiency_j_per_th(snapshot.power, snapshot.hashrate);
    snapshot
}

fn scan_max(map: &Map<String, Value>, accept: fn(&str) -> bool) -> f64 {
    map.iter()
        .filter(|(k, _)| accept(k))
        .filter_map(|(_, v)| number_from_value(v))
        .fold(0.0, f64::max)
}
