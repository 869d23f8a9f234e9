//! 控制台日志格式化器

use chrono::{DateTime, Local};
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// 监控专用的简洁格式：`[时间] 级别 目标 消息`
pub struct MonitorFormatter {
    /// 是否启用彩色输出
    colored: bool,
}

impl MonitorFormatter {
    pub fn new(colored: bool) -> Self {
        Self { colored }
    }

    fn level_style(&self, level: &Level) -> (&'static str, &'static str) {
        let label = match *level {
            Level::ERROR => "ERR",
            Level::WARN => "WRN",
            Level::INFO => "   ",
            Level::DEBUG => "DBG",
            Level::TRACE => "TRC",
        };
        if !self.colored {
            return (label, "");
        }
        let color = match *level {
            Level::ERROR => "\x1b[31m", // 红色
            Level::WARN => "\x1b[33m",  // 黄色
            Level::INFO => "\x1b[32m",  // 绿色
            Level::DEBUG => "\x1b[36m", // 青色
            Level::TRACE => "\x1b[37m", // 白色
        };
        (label, color)
    }
}

/// 日志目标对应的图标
pub fn target_icon(target: &str) -> &'static str {
    match target {
        "device" => "🔧",
        "discovery" => "📡",
        "monitoring" => "📊",
        _ if target.starts_with("minerwatch_rs::adapters") => "🔌",
        _ if target.starts_with("minerwatch_rs::protocol") => "🔌",
        _ => "  ",
    }
}

impl<S, N> FormatEvent<S, N> for MonitorFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let now: DateTime<Local> = Local::now();
        let timestamp = now.format("%H:%M:%S%.3f");

        let (level_str, level_color) = self.level_style(metadata.level());
        let reset = if self.colored { "\x1b[0m" } else { "" };

        write!(
            writer,
            "[{}] {}{}{} {} ",
            timestamp,
            level_color,
            level_str,
            reset,
            target_icon(metadata.target())
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// 格式化温度显示
pub fn format_temperature(temp: f64) -> String {
    format!("{:.1}°C", temp)
}

/// 格式化功耗显示
pub fn format_power(power: f64) -> String {
    if power >= 1000.0 {
        format!("{:.2} kW", power / 1000.0)
    } else {
        format!("{:.0} W", power)
    }
}

/// 格式化状态指示器
pub fn format_status(online: bool) -> String {
    if online {
        "🟢 在线".to_string()
    } else {
        "🔴 离线".to_string()
    }
}
