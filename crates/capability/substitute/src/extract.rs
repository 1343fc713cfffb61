//! 提取阶段：原始载荷 → ProcessingCache。

use crate::error::SubstituteError;
use domain::{
    MappingRule, MappingType, ProcessingCache, SubstituteValue, TOKEN_TOPIC_LEVEL, TenantContext,
    path,
};
use serde_json::{Value, json};
use std::sync::Arc;

/// 提取能力接口：为每个目标路径产出零个或多个带类型的值。
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        ctx: &TenantContext,
        rule: &MappingRule,
        payload: &Value,
        topic_levels: &[String],
    ) -> Result<ProcessingCache, SubstituteError>;
}

/// 封闭的提取策略集合；替换引擎只依赖 [`Extractor`]。
#[derive(Clone)]
pub enum ExtractionStrategy {
    JsonField(JsonFieldExtractor),
    Custom(Arc<dyn Extractor>),
}

impl Default for ExtractionStrategy {
    fn default() -> Self {
        ExtractionStrategy::JsonField(JsonFieldExtractor)
    }
}

impl Extractor for ExtractionStrategy {
    fn extract(
        &self,
        ctx: &TenantContext,
        rule: &MappingRule,
        payload: &Value,
        topic_levels: &[String],
    ) -> Result<ProcessingCache, SubstituteError> {
        match self {
            ExtractionStrategy::JsonField(extractor) => {
                extractor.extract(ctx, rule, payload, topic_levels)
            }
            ExtractionStrategy::Custom(extractor) => {
                extractor.extract(ctx, rule, payload, topic_levels)
            }
        }
    }
}

/// 按映射类型把原始字节转换为可提取的 JSON 文档。
pub fn payload_document(rule: &MappingRule, payload: &[u8]) -> Result<Value, SubstituteError> {
    match rule.mapping_type {
        MappingType::Json => serde_json::from_slice(payload)
            .map_err(|err| SubstituteError::InvalidPayload(err.to_string())),
        MappingType::FlatFile => {
            let text = std::str::from_utf8(payload)
                .map_err(|err| SubstituteError::InvalidPayload(err.to_string()))?;
            Ok(json!({ "message": text }))
        }
        MappingType::Hex => Ok(json!({ "message": hex::encode(payload) })),
    }
}

/// 固定字段提取：按点分路径读取源值。
///
/// `_TOPIC_LEVEL_[i]` 读取 topic 层级；源缺失时该目标路径为空列表；
/// 显式 null 产出一个空值标记；`expandArray` 时数组按元素展开为多个设备条目。
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFieldExtractor;

impl Extractor for JsonFieldExtractor {
    fn extract(
        &self,
        _ctx: &TenantContext,
        rule: &MappingRule,
        payload: &Value,
        topic_levels: &[String],
    ) -> Result<ProcessingCache, SubstituteError> {
        let mut levels = serde_json::Map::new();
        levels.insert(TOKEN_TOPIC_LEVEL.to_string(), json!(topic_levels));
        let levels = Value::Object(levels);
        let mut cache = ProcessingCache::new();
        for substitution in &rule.substitutions {
            let source = if substitution.path_source.starts_with(TOKEN_TOPIC_LEVEL) {
                &levels
            } else {
                payload
            };
            let selected = path::select(source, &substitution.path_source).map_err(|err| {
                SubstituteError::Extraction(format!("{}: {err}", substitution.path_source))
            })?;
            let target = substitution.path_target.as_str();
            let strategy = substitution.repair_strategy;
            match selected {
                None => cache.touch(target),
                Some(Value::Array(items)) if substitution.expand_array => {
                    cache.touch(target);
                    for item in items {
                        cache.push(target, SubstituteValue::from_json(item, strategy));
                    }
                }
                Some(value) => cache.push(target, SubstituteValue::from_json(value, strategy)),
            }
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Direction, Substitution, TargetApi, ValueType};

    fn rule(substitutions: Vec<Substitution>, mapping_type: MappingType) -> MappingRule {
        MappingRule {
            id: "m".to_string(),
            name: "m".to_string(),
            direction: Direction::Inbound,
            subscription_topic: "device/+".to_string(),
            mapping_topic_sample: "device/x".to_string(),
            publish_topic: None,
            filter_mapping: None,
            filter_inventory: None,
            target_api: TargetApi::Measurement,
            mapping_type,
            target_template: json!({}),
            substitutions,
            map_device_identifier: false,
            external_id_type: String::new(),
            active: true,
            deployed: true,
            debug: false,
        }
    }

    #[test]
    fn extracts_topic_levels_and_expanded_arrays() {
        let rule = rule(
            vec![
                Substitution::new("_TOPIC_LEVEL_[1]", "source.name"),
                Substitution::new("devices[*].id", "_IDENTITY_.globalId").expanded(),
                Substitution::new("devices[*].t", "c8y.T.value"),
                Substitution::new("missing", "absent"),
                Substitution::new("nothing", "nulled"),
            ],
            MappingType::Json,
        );
        let payload = json!({
            "devices": [{ "id": "a", "t": 1 }, { "id": "b", "t": 2 }],
            "nothing": null
        });
        let levels = vec!["device".to_string(), "x".to_string()];
        let cache = JsonFieldExtractor
            .extract(&TenantContext::default(), &rule, &payload, &levels)
            .expect("extract");

        assert_eq!(cache.get("source.name").expect("name")[0].value, json!("x"));
        assert_eq!(cache.len_of("_IDENTITY_.globalId"), 2);
        assert_eq!(cache.len_of("c8y.T.value"), 1);
        assert_eq!(
            cache.get("c8y.T.value").expect("t")[0].value_type,
            ValueType::Array
        );
        assert!(cache.contains("absent"));
        assert_eq!(cache.len_of("absent"), 0);
        assert_eq!(cache.get("nulled").expect("nulled")[0].value_type, ValueType::Ignore);
    }

    #[test]
    fn payload_document_per_mapping_type() {
        let json_rule = rule(Vec::new(), MappingType::Json);
        assert_eq!(
            payload_document(&json_rule, br#"{"a":1}"#).expect("json"),
            json!({ "a": 1 })
        );
        assert!(matches!(
            payload_document(&json_rule, b"not json"),
            Err(SubstituteError::InvalidPayload(_))
        ));

        let flat = rule(Vec::new(), MappingType::FlatFile);
        assert_eq!(
            payload_document(&flat, b"12,34").expect("flat"),
            json!({ "message": "12,34" })
        );

        let hex_rule = rule(Vec::new(), MappingType::Hex);
        assert_eq!(
            payload_document(&hex_rule, &[0x0a, 0xff]).expect("hex"),
            json!({ "message": "0aff" })
        );
    }
}
