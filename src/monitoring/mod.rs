//! 设备监控：轮询调度与事件分发

pub mod events;
pub mod scheduler;


pub use events::{EventBus, MonitorEvent};
pub use scheduler::{PollOutcome, PollScheduler};
