use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::RepairStrategy;

/// 提取值的类型标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Textual,
    Number,
    Boolean,
    Object,
    Array,
    /// 空值标记（源中缺失或为 null）。
    Ignore,
}

impl ValueType {
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueType::Textual,
            Value::Number(_) => ValueType::Number,
            Value::Bool(_) => ValueType::Boolean,
            Value::Object(_) => ValueType::Object,
            Value::Array(_) => ValueType::Array,
            Value::Null => ValueType::Ignore,
        }
    }
}

/// 单个提取值。创建后不可变，按位置应用时克隆。
#[derive(Debug, Clone, PartialEq)]
pub struct SubstituteValue {
    pub value: Value,
    pub value_type: ValueType,
    pub repair_strategy: RepairStrategy,
}

impl SubstituteValue {
    pub fn new(value: Value, value_type: ValueType, repair_strategy: RepairStrategy) -> Self {
        Self {
            value,
            value_type,
            repair_strategy,
        }
    }

    /// 按 JSON 值推断类型标签。
    pub fn from_json(value: Value, repair_strategy: RepairStrategy) -> Self {
        let value_type = ValueType::classify(&value);
        Self::new(value, value_type, repair_strategy)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::from_json(Value::String(value.into()), RepairStrategy::Default)
    }

    pub fn null(repair_strategy: RepairStrategy) -> Self {
        Self::new(Value::Null, ValueType::Ignore, repair_strategy)
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null() || self.value_type == ValueType::Ignore
    }

    /// 写入目标载荷时使用的值：数值标签的文本按数字解析，解析失败保留原文。
    pub fn typed_value(&self) -> Value {
        match (&self.value_type, &self.value) {
            (ValueType::Ignore, _) => Value::Null,
            (ValueType::Number, Value::String(raw)) => {
                let trimmed = raw.trim();
                if let Ok(int) = trimmed.parse::<i64>() {
                    Value::from(int)
                } else if let Some(number) = trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                {
                    Value::Number(number)
                } else {
                    self.value.clone()
                }
            }
            (ValueType::Boolean, Value::String(raw)) => match raw.trim() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => self.value.clone(),
            },
            _ => self.value.clone(),
        }
    }

    /// 文本形式（用于设备标识）。
    pub fn as_text(&self) -> Option<String> {
        match &self.value {
            Value::String(raw) => Some(raw.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }
}

/// 目标路径 → 按设备顺序排列的提取值列表。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingCache {
    entries: BTreeMap<String, Vec<SubstituteValue>>,
}

impl ProcessingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个值到路径列表末尾。
    pub fn push(&mut self, path: impl Into<String>, value: SubstituteValue) {
        self.entries.entry(path.into()).or_default().push(value);
    }

    /// 确保路径存在（可能为空列表）。
    pub fn touch(&mut self, path: impl Into<String>) {
        self.entries.entry(path.into()).or_default();
    }

    pub fn insert(&mut self, path: impl Into<String>, values: Vec<SubstituteValue>) {
        self.entries.insert(path.into(), values);
    }

    pub fn get(&self, path: &str) -> Option<&[SubstituteValue]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len_of(&self, path: &str) -> usize {
        self.entries.get(path).map_or(0, Vec::len)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[SubstituteValue])> {
        self.entries
            .iter()
            .map(|(path, values)| (path.as_str(), values.as_slice()))
    }

    pub fn max_len(&self) -> usize {
        self.entries.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
