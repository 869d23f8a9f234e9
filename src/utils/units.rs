//! 难度与算力单位换算
//!
//! 各家固件上报的难度值可能是数字，也可能是带后缀的字符串（如 `"56.4M"`），
//! 离开适配器之前必须统一成普通数值。

use serde_json::Value;

/// 难度后缀及倍数，`B` 与 `G` 同义
const DIFFICULTY_SUFFIXES: &[(char, f64)] = &[
    ('K', 1e3),
    ('M', 1e6),
    ('G', 1e9),
    ('B', 1e9),
    ('T', 1e12),
];

/// 解析难度字符串为数值
///
/// 语法：可选的十进制数字，后跟可选的大小写不敏感后缀 `K/M/G/B/T`。
/// 空串或无法解析的输入返回 `0.0`。
///
/// # 示例
/// ```
/// use minerwatch_rs::utils::units::parse_difficulty;
///
/// assert_eq!(parse_difficulty("100"), 100.0);
/// assert_eq!(parse_difficulty("garbage"), 0.0);
/// ```
pub fn parse_difficulty(input: &str) -> f64 {
    let s = input.trim();
    let Some(last) = s.chars().last() else {
        return 0.0;
    };

    let (number_part, multiplier) = if last.is_ascii_alphabetic() {
        let upper = last.to_ascii_uppercase();
        match DIFFICULTY_SUFFIXES.iter().find(|(suffix, _)| *suffix == upper) {
            Some((_, multiplier)) => (s[..s.len() - 1].trim_end(), *multiplier),
            None => return 0.0,
        }
    } else {
        (s, 1.0)
    };

    match number_part.parse::<f64>() {
        Ok(value) => sanitize(value * multiplier),
        Err(_) => 0.0,
    }
}

/// 将 JSON 中的难度值（数字或后缀字符串）统一为数值
pub fn difficulty_from_value(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().map(sanitize).unwrap_or(0.0),
        Value::String(s) => parse_difficulty(s),
        _ => 0.0,
    }
}

/// 将 JSON 中的普通数值（数字或数字字符串）读取为 `f64`
pub fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// 难度的紧凑显示，用于日志
pub fn format_difficulty(difficulty: f64) -> String {
    if !difficulty.is_finite() || difficulty <= 0.0 {
        return "0".to_string();
    }

    if difficulty >= 1e12 {
        format!("{:.2}T", difficulty / 1e12)
    } else if difficulty >= 1e9 {
        format!("{:.2}G", difficulty / 1e9)
    } else if difficulty >= 1e6 {
        format!("{:.2}M", difficulty / 1e6)
    } else if difficulty >= 1e3 {
        format!("{:.2}K", difficulty / 1e3)
    } else {
        format!("{:.0}", difficulty)
    }
}

/// 格式化算力显示，输入单位为 GH/s
///
/// 自动选择 MH/s、GH/s、TH/s 或 PH/s，使显示值落在 1-999 之间。
pub fn format_hashrate_gh(gh: f64) -> String {
    if !gh.is_finite() || gh <= 0.0 {
        return "0.00 GH/s".to_string();
    }

    let (value, unit) = if gh >= 1_000_000.0 {
        (gh / 1_000_000.0, "PH/s")
    } else if gh >= 1_000.0 {
        (gh / 1_000.0, "TH/s")
    } else if gh >= 1.0 {
        (gh, "GH/s")
    } else {
        (gh * 1_000.0, "MH/s")
    };

    if value >= 100.0 {
        format!("{:.1} {}", value, unit)
    } else if value >= 10.0 {
        format!("{:.2} {}", value, unit)
    } else {
        format!("{:.3} {}", value, unit)
    }
}
