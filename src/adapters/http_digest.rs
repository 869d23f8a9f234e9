use super::fields::{count, difficulty, elements, lookup, number, text};
use super::MinerAdapter;
use crate::device::{Credentials, DeviceType};
use crate::error::FetchError;
use crate::protocol::DigestChallenge;
use crate::telemetry::{efficiency_j_per_th, split_pool_url, BoardSnapshot, TelemetrySnapshot};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub const MINER_STATUS_PATH: &str = "/cgi-bin/get_miner_status.cgi";
pub const SYSTEM_INFO_PATH: &str = "/cgi-bin/get_system_info.cgi";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

/// 未上报链电压时使用的回退值（mV）
pub const FALLBACK_CHAIN_VOLTAGE_MV: f64 = 8500.0;

const SUMMARY_KEYS: &[&str] = &["summary", "SUMMARY"];
const POOLS_KEYS: &[&str] = &["pools", "POOLS"];
const CHAINS_KEYS: &[&str] = &["devs", "chains", "chain"];
const FANS_KEYS: &[&str] = &["fans", "fan"];

const HASHRATE_KEYS: &[&str] = &["ghs5s", "GHS 5s", "ghs_5s", "ghsav", "GHS av"];
const ACCEPTED_KEYS: &[&str] = &["accepted", "Accepted"];
const REJECTED_KEYS: &[&str] = &["rejected", "Rejected"];
const BEST_SHARE_KEYS: &[&str] = &["bestshare", "best_share", "Best Share"];
const UPTIME_KEYS: &[&str] = &["elapsed", "Elapsed"];
const FAN_PWM_KEYS: &[&str] = &["fan_pwm", "fanpwm"];

const CHAIN_INDEX_KEYS: &[&str] = &["index", "chain", "id"];
const CHAIN_CHIPS_KEYS: &[&str] = &["chain_acn", "asic_num", "chips"];
const CHAIN_FREQ_KEYS: &[&str] = &["freq", "freqavg", "frequency"];
const CHAIN_RATE_KEYS: &[&str] = &["rate", "chain_rate", "hashrate"];
const CHAIN_TEMP_KEYS: &[&str] = &["temp", "temp_pcb", "temp1"];
const CHAIN_CHIP_TEMP_KEYS: &[&str] = &["temp2", "temp_chip", "temp_chip_max"];
const CHAIN_VOLTAGE_KEYS: &[&str] = &["chain_vol", "voltage", "chain_voltage"];
const CHAIN_POWER_KEYS: &[&str] = &["power", "chain_power"];
const CHAIN_HW_KEYS: &[&str] = &["hw", "chain_hw"];

const POOL_URL_KEYS: &[&str] = &["url", "URL"];
const POOL_USER_KEYS: &[&str] = &["user", "User"];
const POOL_STATUS_KEYS: &[&str] = &["status", "Status"];
const POOL_DIFF_KEYS: &[&str] = &["diff", "Diff", "Stratum Difficulty"];

const MODEL_KEYS: &[&str] = &["minertype", "miner_type", "Type"];
const HOSTNAME_KEYS: &[&str] = &["hostname"];
const FIRMWARE_KEYS: &[&str] = &["system_filesystem_version", "firmware_version", "bmminer_version", "cgminer_version"];

/// 需要 Digest 认证的老款 ASIC 适配器
pub struct HttpDigestAdapter {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for HttpDigestAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HttpDigestAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn send(&self, url: &str, authorization: Option<String>) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        request.send().await
    }

    /// 先匿名请求，遇到 401 时按挑战计算 Digest 头重试一次
    async fn get_json(
        &self,
        address: &str,
        path: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Value, FetchError> {
        let url = format!("http://{}{}", address, path);
        let mut response = self
            .send(&url, None)
            .await
            .map_err(|e| FetchError::from_reqwest(address, e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let credentials = credentials.ok_or_else(|| FetchError::AuthenticationRequired {
                address: address.to_string(),
            })?;

            let header = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| FetchError::AuthenticationFailed {
                    address: address.to_string(),
                    reason: "401 without WWW-Authenticate header".to_string(),
                })?;

            let authorization = DigestChallenge::parse(&header)
                .and_then(|c| c.authorization("GET", path, &credentials.username, &credentials.password))
                .map_err(|e| FetchError::AuthenticationFailed {
                    address: address.to_string(),
                    reason: format!("cannot authenticate: {}", e),
                })?;

            response = self
                .send(&url, Some(authorization))
                .await
                .map_err(|e| FetchError::from_reqwest(address, e))?;

            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(FetchError::AuthenticationFailed {
                    address: address.to_string(),
                    reason: "credentials rejected".to_string(),
                });
            }
        }

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

    async fn fetch_snapshot(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Result<TelemetrySnapshot, FetchError> {
        let status = self.get_json(address, MINER_STATUS_PATH, credentials).await?;

        // 型号只用于显示，失败时按拓扑推断
        let system_info = match self.get_json(address, SYSTEM_INFO_PATH, credentials).await {
            Ok(info) => Some(info),
            Err(e) => {
                debug!("System info unavailable for {}: {}", address, e);
                None
            }
        };

        parse_miner_status(address, &status, system_info.as_ref())
    }
}

#[async_trait]
impl MinerAdapter for HttpDigestAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::HttpDigest
    }

    async fn fetch(
        &self,
        address: &str,
        credentials: Option<&Credentials>,
    ) -> Result<TelemetrySnapshot, FetchError> {
        let result = self.fetch_snapshot(address, credentials).await;
        if let Err(e) = &result {
            debug!("HTTP-Digest fetch failed for {}: {}", address, e);
        }
        result
    }

    async fn requires_authentication(&self, address: &str) -> bool {
        let url = format!("http://{}{}", address, MINER_STATUS_PATH);
        match self.send(&url, None).await {
            Ok(response) => {
                response.status() == StatusCode::UNAUTHORIZED
                    && response
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("digest"))
                        .unwrap_or(false)
            }
            Err(_) => false,
        }
    }
}

/// 按链数与算力推断型号和算法
pub fn infer_model(chain_count: usize, hashrate_gh: f64) -> (&'static str, &'static str) {
    match chain_count {
        4 if hashrate_gh < 10.0 => ("Antminer L3+", "Scrypt"),
        3 => ("Antminer S9", "SHA-256"),
        _ => ("Unknown Antminer", "SHA-256"),
    }
}

/// 电压统一为 mV，小于 100 的值视为伏特
pub fn normalize_voltage_mv(value: f64) -> f64 {
    if value > 0.0 && value < 100.0 {
        value * 1000.0
    } else {
        value
    }
}

/// 解析 `get_miner_status.cgi` 响应，`system_info` 可选
pub fn parse_miner_status(
    address: &str,
    status: &Value,
    system_info: Option<&Value>,
) -> Result<TelemetrySnapshot, FetchError> {
    let summary = lookup(status, SUMMARY_KEYS).and_then(|s| elements(s).into_iter().next());
    let chains: Vec<&Value> = lookup(status, CHAINS_KEYS).map(elements).unwrap_or_default();

    let Some(summary) = summary else {
        return Err(FetchError::ProtocolMismatch {
            address: address.to_string(),
            reason: "miner status has no summary section".to_string(),
        });
    };

    let mut snapshot = TelemetrySnapshot::new(DeviceType::HttpDigest);
    snapshot.accepted_shares = count(summary, ACCEPTED_KEYS);
    snapshot.rejected_shares = count(summary, REJECTED_KEYS);
    snapshot.best_difficulty = difficulty(summary, BEST_SHARE_KEYS);
    snapshot.uptime_seconds = count(summary, UPTIME_KEYS);
    snapshot.fan_speed = number(summary, FAN_PWM_KEYS);

    let mut boards = Vec::with_capacity(chains.len());
    let mut reported_voltages = Vec::new();
    let mut total_power = 0.0;
    let mut frequency_sum = 0.0;
    let mut frequency_count = 0usize;
    let mut max_temperature: f64 = 0.0;
    let mut max_fan_rpm: f64 = 0.0;
    let mut chain_rate_sum = 0.0;

    for (position, chain) in chains.iter().enumerate() {
        let index = lookup(chain, CHAIN_INDEX_KEYS)
            .and_then(crate::utils::units::number_from_value)
            .map(|v| v as u32)
            .unwrap_or(position as u32);

        let board = BoardSnapshot {
            index,
            hashrate: number(chain, CHAIN_RATE_KEYS),
            temperature: number(chain, CHAIN_TEMP_KEYS),
            chip_temperature: number(chain, CHAIN_CHIP_TEMP_KEYS),
            frequency: number(chain, CHAIN_FREQ_KEYS),
            voltage: normalize_voltage_mv(number(chain, CHAIN_VOLTAGE_KEYS)),
            power: number(chain, CHAIN_POWER_KEYS),
            chip_count: count(chain, CHAIN_CHIPS_KEYS) as u32,
            hardware_errors: count(chain, CHAIN_HW_KEYS),
        };

        total_power += board.power;
        chain_rate_sum += board.hashrate;
        if board.frequency > 0.0 {
            frequency_sum += board.frequency;
            frequency_count += 1;
        }
        if board.voltage > 0.0 {
            reported_voltages.push(board.voltage);
        }
        max_temperature = max_temperature.max(board.temperature).max(board.chip_temperature);
        max_fan_rpm = max_fan_rpm.max(max_fan_slot(chain));

        boards.push(board);
    }

    max_fan_rpm = max_fan_rpm.max(max_fan_slot(summary));
    if let Some(fans) = lookup(status, FANS_KEYS) {
        max_fan_rpm = max_fan_rpm.max(max_fan_list(fans));
    }

    snapshot.hashrate = match number(summary, HASHRATE_KEYS) {
        rate if rate > 0.0 => rate,
        _ => chain_rate_sum,
    };
    snapshot.power = total_power;
    snapshot.temperature = max_temperature;
    snapshot.fan_rpm = max_fan_rpm;
    if frequency_count > 0 {
        snapshot.frequency = frequency_sum / frequency_count as f64;
    }

    snapshot.voltage = if reported_voltages.is_empty() {
        warn!(
            "No chain voltage reported by {}, using {:.0} mV fallback",
            address, FALLBACK_CHAIN_VOLTAGE_MV
        );
        for board in boards.iter_mut() {
            board.voltage = FALLBACK_CHAIN_VOLTAGE_MV;
        }
        FALLBACK_CHAIN_VOLTAGE_MV
    } else {
        reported_voltages.iter().sum::<f64>() / reported_voltages.len() as f64
    };
    snapshot.current = if snapshot.voltage > 0.0 {
        snapshot.power / (snapshot.voltage / 1000.0)
    } else {
        0.0
    };
    snapshot.efficiency = efficiency_j_per_th(snapshot.power, snapshot.hashrate);

    apply_active_pool(&mut snapshot, status);

    let (inferred_model, inferred_algorithm) = infer_model(chains.len(), snapshot.hashrate);
    let vendor_model = system_info.map(|info| text(info, MODEL_KEYS)).unwrap_or_default();
    if vendor_model.is_empty() {
        snapshot.model = inferred_model.to_string();
        snapshot.algorithm = inferred_algorithm.to_string();
    } else {
        snapshot.algorithm = if is_scrypt_model(&vendor_model) {
            "Scrypt".to_string()
        } else {
            inferred_algorithm.to_string()
        };
        snapshot.model = vendor_model;
    }
    if let Some(info) = system_info {
        snapshot.hostname = text(info, HOSTNAME_KEYS);
        snapshot.firmware_version = text(info, FIRMWARE_KEYS);
    }
    if snapshot.hostname.is_empty() {
        snapshot.hostname = address.to_string();
    }

    snapshot.boards = boards;
    snapshot.raw = match system_info {
        Some(info) => json!({ "miner_status": status, "system_info": info }),
        None => status.clone(),
    };

    Ok(snapshot)
}

fn is_scrypt_model(model: &str) -> bool {
    let upper = model.to_ascii_uppercase();
    upper.contains(" L3") || upper.contains(" L7") || upper.starts_with("L3") || upper.starts_with("L7")
}

/// 当前矿池：第一个 Alive 的矿池，否则第一个
fn apply_active_pool(snapshot: &mut TelemetrySnapshot, status: &Value) {
    let pools = lookup(status, POOLS_KEYS).map(elements).unwrap_or_default();
    let active = pools
        .iter()
        .find(|p| text(p, POOL_STATUS_KEYS).eq_ignore_ascii_case("alive"))
        .or_else(|| pools.first());

    if let Some(pool) = active {
        snapshot.pool_url = text(pool, POOL_URL_KEYS);
        let (host, port) = split_pool_url(&snapshot.pool_url);
        snapshot.pool_host = host;
        snapshot.pool_port = port;
        snapshot.pool_user = text(pool, POOL_USER_KEYS);
        snapshot.pool_difficulty = difficulty(pool, POOL_DIFF_KEYS);
    }
}

/// 对象中 `fan1`..`fanN` 形式的槽位最大转速
fn max_fan_slot(obj: &Value) -> f64 {
    obj.as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| is_fan_slot(k))
                .filter_map(|(_, v)| crate::utils::units::number_from_value(v))
                .fold(0.0, f64::max)
        })
        .unwrap_or(0.0)
}

fn max_fan_list(fans: &Value) -> f64 {
    match fans {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(_) => Some(number(item, &["rpm", "speed"])),
                other => crate::utils::units::number_from_value(other),
            })
            .fold(0.0, f64::max),
        Value::Object(_) => max_fan_slot(fans),
        _ => 0.0,
    }
}

pub(crate) fn is_fan_slot(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    let Some(rest) = lower.strip_prefix("fan") else {
        return false;
    };
    let rest = rest.strip_prefix('_').unwrap_or(rest);
    rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}
