use crate::device::DeviceId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("System error: {0}")]
    System(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("Challenge is not a Digest challenge: {header}")]
    NotDigest { header: String },

    #[error("Challenge is missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Unsupported digest algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
}

#[derive(Error, Debug)]
pub enum CgminerError {
    #[error("Connection failed: {address}, error: {error}")]
    Connection { address: String, error: String },

    #[error("Request timed out after {timeout_ms}ms: {address}")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("Socket error: {address}, error: {error}")]
    Io { address: String, error: String },

    #[error("Empty response from {address}")]
    EmptyResponse { address: String },
}

/// 适配器拉取失败原因
///
/// 调度器只关心 [`FetchError::failure_kind`]：瞬时失败计入滞后计数，
/// 认证失败需要用户提供凭据，协议不匹配触发一次性重新识别。
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Request timed out: {address}")]
    Timeout { address: String },

    #[error("Connection failed: {address}, error: {error}")]
    Connection { address: String, error: String },

    #[error("HTTP error: {address}, status: {status}")]
    Http { address: String, status: u16 },

    #[error("Invalid response from {address}: {reason}")]
    InvalidResponse { address: String, reason: String },

    #[error("Authentication required: {address}")]
    AuthenticationRequired { address: String },

    #[error("Authentication failed: {address}, reason: {reason}")]
    AuthenticationFailed { address: String, reason: String },

    #[error("Protocol mismatch: {address}, reason: {reason}")]
    ProtocolMismatch { address: String, reason: String },
}

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 超时、连接被拒、响应不完整
    Transient,
    /// 设备要求凭据或凭据错误
    Authentication,
    /// 适配器运行成功但响应结构无法识别
    ProtocolMismatch,
}

impl FetchError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FetchError::AuthenticationRequired { .. }
            | FetchError::AuthenticationFailed { .. } => FailureKind::Authentication,
            FetchError::ProtocolMismatch { .. } => FailureKind::ProtocolMismatch,
            _ => FailureKind::Transient,
        }
    }

    pub fn is_auth_error(&self) -> bool {
        self.failure_kind() == FailureKind::Authentication
    }

    pub(crate) fn from_reqwest(address: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout { address: address.to_string() }
        } else if error.is_decode() || error.is_body() {
            FetchError::InvalidResponse {
                address: address.to_string(),
                reason: error.to_string(),
            }
        } else {
            FetchError::Connection {
                address: address.to_string(),
                error: error.to_string(),
            }
        }
    }
}

impl From<CgminerError> for FetchError {
    fn from(error: CgminerError) -> Self {
        match error {
            CgminerError::Timeout { address, .. } => FetchError::Timeout { address },
            CgminerError::Connection { address, error } | CgminerError::Io { address, error } => {
                FetchError::Connection { address, error }
            }
            CgminerError::EmptyResponse { address } => FetchError::InvalidResponse {
                address,
                reason: "empty response".to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Device not found: {device_id}")]
    NotFound { device_id: DeviceId },

    #[error("Registry backend error: {error}")]
    Backend { error: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Telemetry storage error: {error}")]
    Backend { error: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("A discovery scan is already running")]
    AlreadyRunning,

    #[error("No local IPv4 subnet found")]
    NoSubnets,

    #[error("Interface enumeration failed: {error}")]
    Interfaces { error: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {field}, reason: {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Invalid value: {field}, value: {value}, reason: {reason}")]
    InvalidValue { field: String, value: String, reason: String },
}
