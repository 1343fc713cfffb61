//! 映射规则模型。

use serde::{Deserialize, Serialize};

/// 设备身份保留前缀。
pub const TOKEN_IDENTITY: &str = "_IDENTITY_";
/// topic 层级保留键。
pub const TOKEN_TOPIC_LEVEL: &str = "_TOPIC_LEVEL_";
/// 请求上下文保留前缀。
pub const TOKEN_CONTEXT_DATA: &str = "_CONTEXT_DATA_";

pub const IDENTITY_EXTERNAL_ID: &str = "_IDENTITY_.externalId";
pub const IDENTITY_GLOBAL_ID: &str = "_IDENTITY_.globalId";
pub const CONTEXT_DATA_API: &str = "_CONTEXT_DATA_.api";
pub const CONTEXT_DATA_PUBLISH_TOPIC: &str = "_CONTEXT_DATA_.publishTopic";

/// 映射方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// 目标平台 API 类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetApi {
    Event,
    Alarm,
    Measurement,
    Inventory,
    Operation,
}

impl TargetApi {
    /// 目标载荷中承载设备标识的字段路径。
    pub fn identifier(&self) -> &'static str {
        match self {
            TargetApi::Event | TargetApi::Alarm | TargetApi::Measurement => "source.id",
            TargetApi::Inventory => "id",
            TargetApi::Operation => "deviceId",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetApi::Event => "EVENT",
            TargetApi::Alarm => "ALARM",
            TargetApi::Measurement => "MEASUREMENT",
            TargetApi::Inventory => "INVENTORY",
            TargetApi::Operation => "OPERATION",
        }
    }

    /// 按名称解析（大小写不敏感），用于 `_CONTEXT_DATA_.api` 覆盖。
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "EVENT" => Some(TargetApi::Event),
            "ALARM" => Some(TargetApi::Alarm),
            "MEASUREMENT" => Some(TargetApi::Measurement),
            "INVENTORY" => Some(TargetApi::Inventory),
            "OPERATION" => Some(TargetApi::Operation),
            _ => None,
        }
    }
}

/// 载荷格式（决定原始字节如何转换为可提取的 JSON 文档）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    #[default]
    Json,
    FlatFile,
    Hex,
}

/// 基数不一致或值缺失时的修复策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    #[default]
    Default,
    UseFirstValueOfArray,
    UseLastValueOfArray,
    Ignore,
    RemoveIfMissing,
    RemoveIfMissingOrNull,
    CreateIfMissing,
}

impl RepairStrategy {
    pub fn removes_when_absent(&self) -> bool {
        matches!(
            self,
            RepairStrategy::RemoveIfMissing | RepairStrategy::RemoveIfMissingOrNull
        )
    }
}

/// 单条字段替换定义。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    pub path_source: String,
    pub path_target: String,
    #[serde(default)]
    pub repair_strategy: RepairStrategy,
    /// 源值为数组时按元素展开（每个元素对应一个设备）。
    #[serde(default)]
    pub expand_array: bool,
}

impl Substitution {
    pub fn new(path_source: impl Into<String>, path_target: impl Into<String>) -> Self {
        Self {
            path_source: path_source.into(),
            path_target: path_target.into(),
            repair_strategy: RepairStrategy::Default,
            expand_array: false,
        }
    }

    pub fn with_repair(mut self, repair_strategy: RepairStrategy) -> Self {
        self.repair_strategy = repair_strategy;
        self
    }

    pub fn expanded(mut self) -> Self {
        self.expand_array = true;
        self
    }
}

/// 租户级映射规则。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub direction: Direction,
    /// 订阅 topic 模式，可包含 `+` 与末尾 `#`。
    pub subscription_topic: String,
    /// 用于结构校验的样例 topic。
    pub mapping_topic_sample: String,
    /// 出站发布 topic 模式。
    #[serde(default)]
    pub publish_topic: Option<String>,
    /// 出站过滤：通知载荷中必须存在的路径。
    #[serde(default)]
    pub filter_mapping: Option<String>,
    /// 入站过滤：设备属性缓存中必须存在的属性路径。
    #[serde(default)]
    pub filter_inventory: Option<String>,
    pub target_api: TargetApi,
    #[serde(default)]
    pub mapping_type: MappingType,
    pub target_template: serde_json::Value,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    /// 是否通过外部 ID 缓存解析设备标识。
    #[serde(default)]
    pub map_device_identifier: bool,
    #[serde(default)]
    pub external_id_type: String,
    /// 启停开关：停用的规则保留在注册表中但不参与解析。
    #[serde(default = "default_true")]
    pub active: bool,
    /// 部署状态：规则装入租户注册表时由注册表置位，调用方传入的值被忽略。
    #[serde(default)]
    pub deployed: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_true() -> bool {
    true
}

impl MappingRule {
    /// 入站规则中承载设备标识的目标路径。
    pub fn device_identifier_path(&self) -> &'static str {
        if self.map_device_identifier {
            IDENTITY_EXTERNAL_ID
        } else {
            IDENTITY_GLOBAL_ID
        }
    }

    /// 定义设备标识的替换：入站按目标路径，出站按源路径。
    pub fn device_identifier_substitution(&self) -> Option<&Substitution> {
        match self.direction {
            Direction::Inbound => {
                let path = self.device_identifier_path();
                self.substitutions.iter().find(|sub| sub.path_target == path)
            }
            Direction::Outbound => self
                .substitutions
                .iter()
                .find(|sub| sub.path_source.starts_with(TOKEN_IDENTITY)),
        }
    }

    /// 决定扇出基数的目标路径。
    pub fn fan_out_path(&self) -> Option<&str> {
        match self.direction {
            Direction::Inbound => Some(self.device_identifier_path()),
            Direction::Outbound => self
                .device_identifier_substitution()
                .map(|sub| sub.path_target.as_str()),
        }
    }

    pub fn repair_strategy_for(&self, path_target: &str) -> RepairStrategy {
        self.substitutions
            .iter()
            .find(|sub| sub.path_target == path_target)
            .map(|sub| sub.repair_strategy)
            .unwrap_or_default()
    }
}
