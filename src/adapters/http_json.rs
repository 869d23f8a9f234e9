use super::fields::{count, difficulty, lookup, number, text};
use super::MinerAdapter;
use crate::device::{Credentials, DeviceType};
use crate::error::FetchError;
use crate::telemetry::{efficiency_j_per_th, split_pool_url, ClusterSummary, TelemetrySnapshot};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const SYSTEM_INFO_PATH: &str = "/api/system/info";
pub const CLUSTER_STATUS_PATH: &str = "/api/cluster/status";

/// 部分固件响应慢，超时比其他协议长
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

const HASHRATE_KEYS: &[&str] = &["hashRate", "hashrate", "hashRate_1m"];
const TEMPERATURE_KEYS: &[&str] = &["temp", "temperature", "chipTemp"];
const VR_TEMPERATURE_KEYS: &[&str] = &["vrTemp", "vr_temp"];
const POWER_KEYS: &[&str] = &["power", "powerWatts"];
const EFFICIENCY_KEYS: &[&str] = &["efficiency", "powerEfficiency"];
const VOLTAGE_KEYS: &[&str] = &["coreVoltageActual", "coreVoltage"];
const CURRENT_MA_KEYS: &[&str] = &["current"];
const FREQUENCY_KEYS: &[&str] = &["frequency", "freq"];
const FAN_SPEED_KEYS: &[&str] = &["fanspeed", "fanSpeed"];
const FAN_RPM_KEYS: &[&str] = &["fanrpm", "fanRpm"];
const UPTIME_KEYS: &[&str] = &["uptimeSeconds", "uptime"];
const ACCEPTED_KEYS: &[&str] = &["sharesAccepted", "accepted"];
const REJECTED_KEYS: &[&str] = &["sharesRejected", "rejected"];
const POOL_DIFFICULTY_KEYS: &[&str] = &["poolDifficulty", "stratumDifficulty", "pool_difficulty", "difficulty"];
const BEST_DIFFICULTY_KEYS: &[&str] = &["bestDiff", "bestDifficulty", "best_diff", "bestShare"];
const BEST_SESSION_DIFFICULTY_KEYS: &[&str] = &["bestSessionDiff", "bestSessionDifficulty", "best_session_diff"];
const POOL_URL_KEYS: &[&str] = &["stratumURL", "stratumUrl", "poolUrl"];
const POOL_PORT_KEYS: &[&str] = &["stratumPort", "poolPort"];
const POOL_USER_KEYS: &[&str] = &["stratumUser", "poolUser"];
const HOSTNAME_KEYS: &[&str] = &["hostname"];
const MODEL_KEYS: &[&str] = &["ASICModel", "asicModel", "deviceModel"];
const VERSION_KEYS: &[&str] = &["version", "firmwareVersion"];
const CLUSTER_MODE_KEYS: &[&str] = &["clusterMode", "cluster_mode"];

const CLUSTER_HASHRATE_KEYS: &[&str] = &["totalHashrate", "total_hashrate"];
const CLUSTER_POWER_KEYS: &[&str] = &["totalPower", "total_power"];
const CLUSTER_ACCEPTED_KEYS: &[&str] = &["totalSharesAccepted", "sharesAccepted"];
const CLUSTER_REJECTED_KEYS: &[&str] = &["totalSharesRejected", "sharesRejected"];
const CLUSTER_MEMBER_KEYS: &[&str] = &["activeSlaves", "slaveCount", "activeMembers"];

/// 集群接口的算力单位是 10 MH/s
const CLUSTER_HASHRATE_DIVISOR: f64 = 100.0;

/// 自研固件 HTTP/JSON 适配器
pub struct HttpJsonAdapter {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpJsonAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpJsonAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn get_json(&self, address: &str, path: &str) -> Result<Value, FetchError> {
        let url = format!("http://{}{}", address, path);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(address, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                address: address.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::InvalidResponse {
                address: address.to_string(),
                reason: e.to_string(),
            })
    }

    async fn fetch_snapshot(&self, address: &str) -> Result<TelemetrySnapshot, FetchError> {
        let info = self.get_json(address, SYSTEM_INFO_PATH).await?;
        let mut snapshot = parse_system_info(address, &info)?;

        if is_cluster_master(&info) {
            match self.get_json(address, CLUSTER_STATUS_PATH).await {
                Ok(status) => {
                    apply_cluster_status(&mut snapshot, &status);
                    snapshot.raw = json!({ "system_info": info, "cluster_status": status });
                }
                Err(e) => warn!("Cluster status unavailable for {}: {}", address, e),
            }
        }

        Ok(snapshot)
    }
}

#[async_trait]
impl MinerAdapter for HttpJsonAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::HttpJson
    }

    async fn fetch(
        &self,
        address: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<TelemetrySnapshot, FetchError> {
        let result = self.fetch_snapshot(address).await;
        if let Err(e) = &result {
            debug!("HTTP-JSON fetch failed for {}: {}", address, e);
        }
        result
    }
}

/// 解析 `/api/system/info` 响应
pub fn parse_system_info(address: &str, info: &Value) -> Result<TelemetrySnapshot, FetchError> {
    if !info.is_object()
        || (lookup(info, HASHRATE_KEYS).is_none() && lookup(info, MODEL_KEYS).is_none())
    {
        return Err(FetchError::ProtocolMismatch {
            address: address.to_string(),
            reason: "system info has neither hashrate nor ASIC model".to_string(),
        });
    }

    let mut snapshot = TelemetrySnapshot::new(DeviceType::HttpJson);
    snapshot.hostname = text(info, HOSTNAME_KEYS);
    snapshot.model = text(info, MODEL_KEYS);
    snapshot.firmware_version = text(info, VERSION_KEYS);
    snapshot.algorithm = "SHA-256".to_string();

    snapshot.hashrate = number(info, HASHRATE_KEYS);
    snapshot.temperature = number(info, TEMPERATURE_KEYS);
    snapshot.vr_temperature = number(info, VR_TEMPERATURE_KEYS);
    snapshot.power = number(info, POWER_KEYS);
    snapshot.voltage = number(info, VOLTAGE_KEYS);
    snapshot.current = number(info, CURRENT_MA_KEYS) / 1000.0;
    snapshot.frequency = number(info, FREQUENCY_KEYS);
    snapshot.fan_speed = number(info, FAN_SPEED_KEYS);
    snapshot.fan_rpm = number(info, FAN_RPM_KEYS);
    snapshot.uptime_seconds = count(info, UPTIME_KEYS);

    snapshot.accepted_shares = count(info, ACCEPTED_KEYS);
    snapshot.rejected_shares = count(info, REJECTED_KEYS);
    snapshot.pool_difficulty = difficulty(info, POOL_DIFFICULTY_KEYS);
    snapshot.best_difficulty = difficulty(info, BEST_DIFFICULTY_KEYS);
    snapshot.best_session_difficulty = difficulty(info, BEST_SESSION_DIFFICULTY_KEYS);

    // 厂商值缺失或非正时才自行计算
    let vendor_efficiency = number(info, EFFICIENCY_KEYS);
    snapshot.efficiency = if vendor_efficiency > 0.0 {
        vendor_efficiency
    } else {
        efficiency_j_per_th(snapshot.power, snapshot.hashrate)
    };

    snapshot.pool_url = text(info, POOL_URL_KEYS);
    let (host, parsed_port) = split_pool_url(&snapshot.pool_url);
    let port = count(info, POOL_PORT_KEYS);
    snapshot.pool_host = host;
    snapshot.pool_port = if port > 0 && port <= u16::MAX as u64 {
        port as u16
    } else {
        parsed_port
    };
    snapshot.pool_user = text(info, POOL_USER_KEYS);

    snapshot.raw = info.clone();
    Ok(snapshot)
}

/// 版本号带 cluster 字样且处于 master 模式
pub fn is_cluster_master(info: &Value) -> bool {
    let version = text(info, VERSION_KEYS).to_ascii_lowercase();
    if !version.contains("cluster") {
        return false;
    }
    text(info, CLUSTER_MODE_KEYS).eq_ignore_ascii_case("master")
}

/// 用集群汇总覆盖单机的算力、功耗、能效与份额
pub fn apply_cluster_status(snapshot: &mut TelemetrySnapshot, status: &Value) {
    let summary = ClusterSummary {
        total_hashrate: number(status, CLUSTER_HASHRATE_KEYS) / CLUSTER_HASHRATE_DIVISOR,
        total_power: number(status, CLUSTER_POWER_KEYS),
        total_efficiency: 0.0,
        accepted_shares: count(status, CLUSTER_ACCEPTED_KEYS),
        rejected_shares: count(status, CLUSTER_REJECTED_KEYS),
        active_members: count(status, CLUSTER_MEMBER_KEYS) as u32,
    };
    let summary = ClusterSummary {
        total_efficiency: efficiency_j_per_th(summary.total_power, summary.total_hashrate),
        ..summary
    };

    snapshot.hashrate = summary.total_hashrate;
    snapshot.power = summary.total_power;
    snapshot.efficiency = summary.total_efficiency;
    snapshot.accepted_shares = summary.accepted_shares;
    snapshot.rejected_shares = summary.rejected_shares;
    snapshot.cluster = Some(summary);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> Value {
        json!({
            "hostname": "bitaxe-01",
            "ASICModel": "BM1366",
            "version": "v2.4.0",
            "hashRate": 500.0,
            "temp": 58.5,
            "vrTemp": 47,
            "power": 12.5,
            "coreVoltageActual": 1180,
            "current": 2450,
            "frequency": 525,
            "fanspeed": 65,
            "fanrpm": 5200,
            "uptimeSeconds": 3600,
            "sharesAccepted": 1200,
            "sharesRejected": 3,
            "bestDiff": "56.4M",
            "bestSessionDiff": "1.2M",
            "stratumDifficulty": 1000,
            "stratumURL": "public-pool.io",
            "stratumPort": 21496,
            "stratumUser": "bc1qexample.bitaxe"
        })
    }

    #[test]
    fn test_parse_system_info() {
        let snapshot = parse_system_info("10.0.0.5", &sample_info()).unwrap();
        assert_eq!(snapshot.vendor, DeviceType::HttpJson);
        assert_eq!(snapshot.hostname, "bitaxe-01");
        assert_eq!(snapshot.model, "BM1366");
        assert_eq!(snapshot.hashrate, 500.0);
        assert_eq!(snapshot.temperature, 58.5);
        assert_eq!(snapshot.vr_temperature, 47.0);
        assert!((snapshot.current - 2.45).abs() < 1e-9);
        assert!((snapshot.best_difficulty - 56_400_000.0).abs() < 1e-3);
        assert!((snapshot.best_session_difficulty - 1_200_000.0).abs() < 1e-6);
        assert_eq!(snapshot.pool_difficulty, 1000.0);
        assert_eq!(snapshot.pool_host, "public-pool.io");
        assert_eq!(snapshot.pool_port, 21496);
        assert_eq!(snapshot.accepted_shares, 1200);
        // 12.5 W / 0.5 TH
        assert!((snapshot.efficiency - 25.0).abs() < 1e-9);
        assert!(snapshot.cluster.is_none());
    }

    #[test]
    fn test_vendor_efficiency_kept_when_positive() {
        let mut info = sample_info();
        info["efficiency"] = json!(19.8);
        let snapshot = parse_system_info("10.0.0.5", &info).unwrap();
        assert_eq!(snapshot.efficiency, 19.8);

        info["efficiency"] = json!(0);
        let snapshot = parse_system_info("10.0.0.5", &info).unwrap();
        assert!((snapshot.efficiency - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_difficulty_aliases() {
        let info = json!({"hashRate": 1.0, "bestDifficulty": 4096, "poolDifficulty": "2K"});
        let snapshot = parse_system_info("10.0.0.5", &info).unwrap();
        assert_eq!(snapshot.best_difficulty, 4096.0);
        assert_eq!(snapshot.pool_difficulty, 2000.0);
    }

    #[test]
    fn test_protocol_mismatch() {
        let result = parse_system_info("10.0.0.5", &json!({"status": "ok"}));
        assert!(matches!(result, Err(FetchError::ProtocolMismatch { .. })));
        assert!(parse_system_info("10.0.0.5", &json!([1, 2])).is_err());
    }

    #[test]
    fn test_cluster_master_detection() {
        let mut info = sample_info();
        assert!(!is_cluster_master(&info));

        info["version"] = json!("v2.4.0-ClusterAxe");
        assert!(!is_cluster_master(&info));

        info["clusterMode"] = json!("Master");
        assert!(is_cluster_master(&info));
    }

    #[test]
    fn test_cluster_override() {
        let mut snapshot = parse_system_info("10.0.0.5", &sample_info()).unwrap();
        let status = json!({
            "totalHashrate": 150000,
            "totalPower": 45.0,
            "totalSharesAccepted": 9000,
            "totalSharesRejected": 12,
            "activeSlaves": 3
        });
        apply_cluster_status(&mut snapshot, &status);

        assert_eq!(snapshot.hashrate, 1500.0);
        assert_eq!(snapshot.power, 45.0);
        assert!((snapshot.efficiency - 30.0).abs() < 1e-9);
        assert_eq!(snapshot.accepted_shares, 9000);
        assert_eq!(snapshot.rejected_shares, 12);
        assert_eq!(snapshot.cluster.unwrap().active_members, 3);
    }
}
