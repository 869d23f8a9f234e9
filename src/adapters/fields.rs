//! 厂商 JSON 字段读取
//!
//! 同一概念在不同固件里有多个拼写，调用方用有序别名表声明，
//! 按顺序取第一个存在的字段。

use crate::utils::units::{difficulty_from_value, number_from_value};
use serde_json::Value;

/// 返回第一个存在且非 null 的别名字段
pub fn lookup<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

/// 第一个能解析为数值的别名字段，都没有时返回 0
pub fn number(obj: &Value, keys: &[&str]) -> f64 {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(number_from_value)
        .unwrap_or(0.0)
}

/// 非负整数计数
pub fn count(obj: &Value, keys: &[&str]) -> u64 {
    let value = number(obj, keys);
    if value > 0.0 {
        value as u64
    } else {
        0
    }
}

pub fn text(obj: &Value, keys: &[&str]) -> String {
    match lookup(obj, keys) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// 难度字段，数字或后缀字符串
pub fn difficulty(obj: &Value, keys: &[&str]) -> f64 {
    lookup(obj, keys).map(difficulty_from_value).unwrap_or(0.0)
}

/// 对象视为单元素，数组取全部对象元素
pub fn elements(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| v.is_object()).collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}
