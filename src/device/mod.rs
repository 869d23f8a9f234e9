pub mod registry;


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use registry::{DeviceRegistry, InMemoryRegistry};

/// 设备 ID，由外部注册表分配
pub type DeviceId = u32;

/// 默认轮询间隔（毫秒）
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// 设备协议族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// 自研固件，HTTP/JSON 接口
    #[serde(alias = "axeos")]
    HttpJson,
    /// 老款 ASIC，HTTP Digest 认证的 CGI 接口
    #[serde(alias = "antminer")]
    HttpDigest,
    /// CGMiner TCP 行协议
    #[serde(alias = "cgminer")]
    CgminerTcp,
}

impl DeviceType {
    /// 自动识别时的尝试顺序
    pub const DETECTION_ORDER: [DeviceType; 3] =
        [DeviceType::HttpJson, DeviceType::HttpDigest, DeviceType::CgminerTcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::HttpJson => "http-json",
            DeviceType::HttpDigest => "http-digest",
            DeviceType::CgminerTcp => "cgminer-tcp",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http-json" | "httpjson" | "axeos" => Ok(DeviceType::HttpJson),
            "http-digest" | "httpdigest" | "antminer" => Ok(DeviceType::HttpDigest),
            "cgminer-tcp" | "cgminer" => Ok(DeviceType::CgminerTcp),
            other => Err(format!("unknown device type: {}", other)),
        }
    }
}

/// 设备登录凭据
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// 密码不进日志
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// 注册表中的设备记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// IP 地址或主机名，可带端口
    pub address: String,
    pub device_type: DeviceType,
    pub credentials: Option<Credentials>,
    pub poll_interval_ms: u64,
    /// 历史最佳难度，只增不减
    pub best_difficulty: f64,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: DeviceId, address: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id,
            address: address.into(),
            device_type,
            credentials: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            best_difficulty: 0.0,
            online: false,
            last_seen: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_poll_interval(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
