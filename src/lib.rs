//! MinerWatch-RS - 局域网矿机遥测采集
//!
//! 持续监控三种互不兼容的矿机固件，把各自的遥测数据归一化为统一的快照：
//! - HTTP/JSON 接口（自研固件，支持集群汇总）
//! - HTTP Digest 认证的 CGI 接口（老款 ASIC）
//! - CGMiner TCP 行协议
//!
//! ## 组成
//!
//! - [`protocol`]：Digest 认证与 CGMiner 行协议
//! - [`adapters`]：各固件的拉取与解析
//! - [`detector`]：按优先级识别设备类型
//! - [`monitoring`]：每台设备独立的轮询会话，带失败迟滞与一次性重新识别
//! - [`discovery`]：/24 网段分批扫描
//!
//! 注册表、遥测存储和事件消费者都是外部协作方，通过
//! [`device::DeviceRegistry`]、[`telemetry::sink::TelemetrySink`] 和
//! [`monitoring::EventBus`] 接入。

pub mod adapters;
pub mod config;
pub mod detector;
pub mod device;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod protocol;
pub mod telemetry;
pub mod utils;

pub use config::Config;
pub use detector::{DetectionOutcome, DeviceDetector};
pub use discovery::DiscoveryScanner;
pub use error::MonitorError;
pub use monitoring::{MonitorEvent, PollScheduler};
pub use telemetry::TelemetrySnapshot;

/// 程序版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 程序名称
pub const NAME: &str = "minerwatch-rs";
