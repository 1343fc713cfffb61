//! 映射管理边界的稳定契约：映射文档格式与规则校验。

use domain::path::{self, MAX_ARRAY_GROWTH, PathSegment};
use domain::topic::{TOPIC_SEPARATOR, contains_wildcard, is_wildcard};
use domain::{Direction, MappingRule, TOPIC_WILDCARD_MULTI, TOPIC_WILDCARD_SINGLE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 启动时加载的映射文档。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDocument {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub mappings: Vec<MappingRule>,
    /// 预置的外部 ID → 全局 ID 对应关系。
    #[serde(default)]
    pub identities: Vec<IdentitySeed>,
    /// 预置的设备属性。
    #[serde(default)]
    pub inventory: Vec<InventorySeed>,
}

impl MappingDocument {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySeed {
    pub external_id_type: String,
    pub external_id: String,
    pub global_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySeed {
    pub source_id: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// 规则校验错误（稳定错误码）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("mapping id must not be empty")]
    MissingId,
    #[error("subscription topic must not be empty")]
    EmptySubscriptionTopic,
    #[error("wildcards must occupy a whole topic level")]
    WildcardNotWholeLevel,
    #[error("only one multi level wildcard is allowed")]
    OnlyOneMultiLevelWildcard,
    #[error("multi level wildcard is only allowed at the end")]
    MultiLevelWildcardOnlyAtEnd,
    #[error("subscription topic and sample do not have the same number of levels")]
    TopicLevelCountMismatch,
    #[error("subscription topic and sample do not have the same structure")]
    TopicStructureMismatch,
    #[error("topic sample must not contain wildcards")]
    SampleContainsWildcard,
    #[error("one substitution defining the device identifier must be used")]
    DeviceIdentifierMissing,
    #[error("only one substitution defining the device identifier can be used")]
    DeviceIdentifierDuplicated,
    #[error("outbound mapping requires a publish topic")]
    PublishTopicMissing,
    #[error("publish topic and sample do not have the same number of levels")]
    PublishTopicLevelCountMismatch,
    #[error("publish topic and sample do not have the same structure")]
    PublishTopicStructureMismatch,
    #[error("substitution target path is not writable")]
    InvalidTargetPath,
    #[error("target template must be a json object")]
    TargetTemplateNotObject,
}

impl ValidationError {
    /// 稳定错误码，供管理界面展示。
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingId => "MAPPING.ID_MISSING",
            ValidationError::EmptySubscriptionTopic => "TOPIC.EMPTY",
            ValidationError::WildcardNotWholeLevel => "TOPIC.WILDCARD_NOT_WHOLE_LEVEL",
            ValidationError::OnlyOneMultiLevelWildcard => "TOPIC.ONLY_ONE_MULTI_LEVEL_WILDCARD",
            ValidationError::MultiLevelWildcardOnlyAtEnd => "TOPIC.MULTI_LEVEL_WILDCARD_ONLY_AT_END",
            ValidationError::TopicLevelCountMismatch => "TOPIC.LEVEL_COUNT_MISMATCH",
            ValidationError::TopicStructureMismatch => "TOPIC.STRUCTURE_MISMATCH",
            ValidationError::SampleContainsWildcard => "TOPIC.SAMPLE_CONTAINS_WILDCARD",
            ValidationError::DeviceIdentifierMissing => "SUBSTITUTION.DEVICE_IDENTIFIER_MISSING",
            ValidationError::DeviceIdentifierDuplicated => {
                "SUBSTITUTION.DEVICE_IDENTIFIER_DUPLICATED"
            }
            ValidationError::PublishTopicMissing => "PUBLISH_TOPIC.MISSING",
            ValidationError::PublishTopicLevelCountMismatch => "PUBLISH_TOPIC.LEVEL_COUNT_MISMATCH",
            ValidationError::PublishTopicStructureMismatch => "PUBLISH_TOPIC.STRUCTURE_MISMATCH",
            ValidationError::InvalidTargetPath => "SUBSTITUTION.INVALID_TARGET_PATH",
            ValidationError::TargetTemplateNotObject => "TEMPLATE.NOT_OBJECT",
        }
    }
}

/// 校验映射规则，返回全部错误（空列表表示通过）。
pub fn validate_mapping(rule: &MappingRule) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if rule.id.trim().is_empty() {
        errors.push(ValidationError::MissingId);
    }

    errors.extend(validate_subscription_topic(&rule.subscription_topic));
    errors.extend(validate_topic_sample(
        &rule.subscription_topic,
        &rule.mapping_topic_sample,
    ));

    match rule.direction {
        Direction::Inbound => {
            let path = rule.device_identifier_path();
            let count = rule
                .substitutions
                .iter()
                .filter(|sub| sub.path_target == path)
                .count();
            if count == 0 {
                errors.push(ValidationError::DeviceIdentifierMissing);
            } else if count > 1 {
                errors.push(ValidationError::DeviceIdentifierDuplicated);
            }
        }
        Direction::Outbound => match rule.publish_topic.as_deref() {
            None => errors.push(ValidationError::PublishTopicMissing),
            Some(publish) if publish.trim().is_empty() => {
                errors.push(ValidationError::PublishTopicMissing)
            }
            Some(publish) => errors.extend(validate_publish_topic(publish, &rule.mapping_topic_sample)),
        },
    }

    if rule
        .substitutions
        .iter()
        .any(|sub| !is_writable_target(&sub.path_target))
    {
        errors.push(ValidationError::InvalidTargetPath);
    }
    if !rule.target_template.is_object() {
        errors.push(ValidationError::TargetTemplateNotObject);
    }
    errors
}

/// 目标路径须可解析、不含 `[*]`，且下标不超过数组补齐上限。
fn is_writable_target(target: &str) -> bool {
    match path::parse(target) {
        Ok(segments) => segments.iter().all(|segment| match segment {
            PathSegment::Key(_) => true,
            PathSegment::Index(index) => *index < MAX_ARRAY_GROWTH,
            PathSegment::Wildcard => false,
        }),
        Err(_) => false,
    }
}

/// 订阅模式的结构校验（前缀树插入前也会调用）。
pub fn validate_subscription_topic(pattern: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if pattern.trim().is_empty() {
        errors.push(ValidationError::EmptySubscriptionTopic);
        return errors;
    }
    let levels: Vec<&str> = pattern.split(TOPIC_SEPARATOR).collect();
    let partial = levels.iter().any(|level| {
        !is_wildcard(level)
            && (level.contains(TOPIC_WILDCARD_SINGLE) || level.contains(TOPIC_WILDCARD_MULTI))
    });
    if partial {
        errors.push(ValidationError::WildcardNotWholeLevel);
    }
    let multi = levels
        .iter()
        .filter(|level| **level == TOPIC_WILDCARD_MULTI)
        .count();
    if multi > 1 {
        errors.push(ValidationError::OnlyOneMultiLevelWildcard);
    }
    if multi >= 1 && levels.last() != Some(&TOPIC_WILDCARD_MULTI) {
        errors.push(ValidationError::MultiLevelWildcardOnlyAtEnd);
    }
    errors
}

fn validate_topic_sample(pattern: &str, sample: &str) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if contains_wildcard(sample) {
        errors.push(ValidationError::SampleContainsWildcard);
    }
    let pattern_levels: Vec<&str> = pattern.split(TOPIC_SEPARATOR).collect();
    let sample_levels: Vec<&str> = sample.split(TOPIC_SEPARATOR).collect();
    if pattern_levels.len() != sample_levels.len() {
        errors.push(ValidationError::TopicLevelCountMismatch);
        return errors;
    }
    let mismatch = pattern_levels
        .iter()
        .zip(&sample_levels)
        .any(|(level, actual)| !is_wildcard(level) && level != actual);
    if mismatch {
        errors.push(ValidationError::TopicStructureMismatch);
    }
    errors
}

fn validate_publish_topic(publish: &str, sample: &str) -> Vec<ValidationError> {
    let publish_levels: Vec<&str> = publish.split(TOPIC_SEPARATOR).collect();
    let sample_levels: Vec<&str> = sample.split(TOPIC_SEPARATOR).collect();
    if publish_levels.len() != sample_levels.len() {
        return vec![ValidationError::PublishTopicLevelCountMismatch];
    }
    let mismatch = publish_levels
        .iter()
        .zip(&sample_levels)
        .any(|(level, actual)| !is_wildcard(level) && level != actual);
    if mismatch {
        vec![ValidationError::PublishTopicStructureMismatch]
    } else {
        Vec::new()
    }
}
