use crate::adapters::cgminer_tcp::DEFAULT_JOULES_PER_TH;
use crate::device::{Credentials, Device, DeviceId, DeviceType, DEFAULT_POLL_INTERVAL_MS};
use crate::error::ConfigError;
use crate::logging::{LogConfig, LogRotation};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;


#[derive(Parser, Debug)]
#[command(author, version, about = "Telemetry monitor for networked mining hardware", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "minerwatch.toml")]
    pub config: String,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    /// Log level (overrides the config file)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll every configured device until interrupted
    Watch,
    /// Scan local /24 subnets for miners
    Scan {
        /// Scan only these addresses instead of the local subnets
        #[arg(long, value_delimiter = ',')]
        addresses: Vec<String>,
    },
    /// Classify a single address
    Detect {
        address: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub rotation: LogRotation,
    /// 控制台输出 JSON
    pub json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            rotation: LogRotation::Daily,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// 连续失败多少次判定离线
    pub failure_threshold: u32,
    /// 设备未指定间隔时使用
    pub default_interval_ms: u64,
    /// 连续失败的第一次触发类型重新识别
    pub redetect_on_failure: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            default_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            redetect_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    pub http_json_timeout_ms: u64,
    pub http_digest_timeout_ms: u64,
    pub cgminer_port: u16,
    pub cgminer_timeout_ms: u64,
    pub cgminer_idle_timeout_ms: u64,
    /// 估算 CGMiner 设备功耗用的能效
    pub cgminer_joules_per_th: f64,
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            http_json_timeout_ms: 8000,
            http_digest_timeout_ms: 6000,
            cgminer_port: 4028,
            cgminer_timeout_ms: 5000,
            cgminer_idle_timeout_ms: 500,
            cgminer_joules_per_th: DEFAULT_JOULES_PER_TH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// 每批并发探测的地址数
    pub concurrency: usize,
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            probe_timeout_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// 配置文件中的一台设备
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub address: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl DeviceEntry {
    pub fn to_device(&self, default_interval_ms: u64) -> Device {
        let mut device = Device::new(self.id, self.address.clone(), self.device_type)
            .with_poll_interval(self.poll_interval_ms.unwrap_or(default_interval_ms));
        if let Some(username) = &self.username {
            device = device.with_credentials(Credentials::new(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            ));
        }
        device
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config_content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path))?;

        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let config_content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, config_content)
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证轮询配置
        if self.poller.failure_threshold == 0 {
            return Err(invalid("poller.failure_threshold", "must be greater than 0"));
        }
        if self.poller.default_interval_ms == 0 {
            return Err(invalid("poller.default_interval_ms", "must be greater than 0"));
        }

        // 验证适配器配置
        if self.adapters.cgminer_port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "adapters.cgminer_port".to_string(),
                value: "0".to_string(),
                reason: "port out of range (1-65535)".to_string(),
            });
        }
        for (field, value) in [
            ("adapters.http_json_timeout_ms", self.adapters.http_json_timeout_ms),
            ("adapters.http_digest_timeout_ms", self.adapters.http_digest_timeout_ms),
            ("adapters.cgminer_timeout_ms", self.adapters.cgminer_timeout_ms),
            ("adapters.cgminer_idle_timeout_ms", self.adapters.cgminer_idle_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "timeout must be greater than 0"));
            }
        }
        if !(self.adapters.cgminer_joules_per_th > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "adapters.cgminer_joules_per_th".to_string(),
                value: self.adapters.cgminer_joules_per_th.to_string(),
                reason: "must be a positive number".to_string(),
            });
        }

        // 验证发现配置
        if self.discovery.concurrency == 0 {
            return Err(invalid("discovery.concurrency", "must be greater than 0"));
        }
        if self.discovery.probe_timeout_ms == 0 {
            return Err(invalid("discovery.probe_timeout_ms", "must be greater than 0"));
        }

        // 验证设备列表
        let mut seen = HashSet::new();
        for entry in &self.devices {
            if !seen.insert(entry.id) {
                return Err(ConfigError::InvalidValue {
                    field: "devices.id".to_string(),
                    value: entry.id.to_string(),
                    reason: "duplicate device id".to_string(),
                });
            }
            if entry.address.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("devices[{}].address", entry.id),
                    value: entry.address.clone(),
                    reason: "address must not be empty".to_string(),
                });
            }
            if entry.poll_interval_ms == Some(0) {
                return Err(invalid("devices.poll_interval_ms", "must be greater than 0"));
            }
        }

        Ok(())
    }

    /// 检查配置是否有效
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// 配置文件中的设备，缺省间隔取 `[poller]` 的值
    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|entry| entry.to_device(self.poller.default_interval_ms))
            .collect()
    }

    /// 合并命令行参数后的日志配置
    pub fn log_config(&self, args: &Args) -> LogConfig {
        let level = if args.debug {
            "debug".to_string()
        } else {
            args.log_level
                .clone()
                .unwrap_or_else(|| self.general.log_level.clone())
        };

        LogConfig {
            level,
            file_path: self.general.log_file.clone(),
            rotation: self.general.rotation,
            json: self.general.json,
            ..LogConfig::default()
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
