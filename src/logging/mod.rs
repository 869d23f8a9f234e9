//! 日志系统

pub mod formatter;

use crate::error::MonitorError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: String,
    /// 日志文件路径
    pub file_path: Option<PathBuf>,
    /// 是否启用彩色输出
    pub colored: bool,
    /// 控制台输出 JSON 而不是紧凑格式
    pub json: bool,
    /// 日志轮转配置
    pub rotation: LogRotation,
}

/// 日志轮转配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// 不轮转
    Never,
    /// 每小时轮转
    Hourly,
    /// 每天轮转
    Daily,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            colored: true,
            json: false,
            rotation: LogRotation::Daily,
        }
    }
}

fn level_filter(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// 初始化日志系统
///
/// 启用文件输出时返回写入线程的 guard，调用方需持有到进程退出。
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>, MonitorError> {
    let env_filter = EnvFilter::from_default_env().add_directive(level_filter(&config.level).into());

    let console_layer = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_ansi(config.colored)
            .event_format(formatter::MonitorFormatter::new(config.colored))
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(console_layer);

    let Some(file_path) = config.file_path else {
        registry
            .try_init()
            .map_err(|e| MonitorError::System(format!("Failed to install logger: {}", e)))?;
        return Ok(None);
    };

    let directory = file_path.parent().unwrap_or(Path::new("."));
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("minerwatch.log");

    let (writer, guard) = match config.rotation {
        LogRotation::Never => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .map_err(|e| MonitorError::System(format!("Failed to open log file: {}", e)))?;
            non_blocking(file)
        }
        LogRotation::Hourly => non_blocking(rolling::hourly(directory, file_name)),
        LogRotation::Daily => non_blocking(rolling::daily(directory, file_name)),
    };

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .json();

    registry
        .with(file_layer)
        .try_init()
        .map_err(|e| MonitorError::System(format!("Failed to install logger: {}", e)))?;

    Ok(Some(guard))
}

#[macro_export]
macro_rules! device_info {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::info!(target: "device", device_id = $device_id, $($arg)*)
    };
}

#[macro_export]
macro_rules! device_warn {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::warn!(target: "device", device_id = $device_id, $($arg)*)
    };
}

#[macro_export]
macro_rules! device_error {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::error!(target: "device", device_id = $device_id, $($arg)*)
    };
}

#[macro_export]
macro_rules! device_debug {
    ($device_id:expr, $($arg:tt)*) => {
        tracing::debug!(target: "device", device_id = $device_id, $($arg)*)
    };
}

/// 温度显示宏
#[macro_export]
macro_rules! temperature_display {
    ($temp:expr) => {
        $crate::logging::formatter::format_temperature($temp)
    };
}

/// 功耗显示宏
#[macro_export]
macro_rules! power_display {
    ($power:expr) => {
        $crate::logging::formatter::format_power($power)
    };
}
