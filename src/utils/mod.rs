//! 实用工具模块
//!
//! 提供难度解析与算力格式化等通用函数

pub mod units;

// 重新导出常用函数
pub use units::{difficulty_from_value, format_difficulty, format_hashrate_gh, parse_difficulty};

/// 算力显示宏，输入单位为 GH/s
///
/// 使用示例：
/// ```
/// use minerwatch_rs::hashrate;
///
/// let rate = 13_500.0;
/// println!("当前算力: {}", hashrate!(rate));
/// // 输出: 当前算力: 13.50 TH/s
/// ```
#[macro_export]
macro_rules! hashrate {
    ($gh:expr) => {
        $crate::utils::format_hashrate_gh($gh)
    };
}
