//! 载荷组装：把一个对齐后的实例写入目标模板，产出可下发的请求描述。

use domain::topic::{is_wildcard, join_levels, split_topic};
use domain::{
    CONTEXT_DATA_API, CONTEXT_DATA_PUBLISH_TOPIC, Direction, MappingRule, PathError,
    RepairStrategy, RequestDescriptor, SubstituteValue, TOKEN_CONTEXT_DATA, TOKEN_IDENTITY,
    TOKEN_TOPIC_LEVEL, TargetApi, TenantContext, path,
};
use mapper_substitute::ReconciledInstance;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// 组装错误：只影响当前实例。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssemblyError {
    #[error("target template is not an object")]
    TemplateNotObject,
    #[error("cannot write {path}: {source}")]
    Path {
        path: String,
        #[source]
        source: PathError,
    },
    #[error("publish topic missing")]
    PublishTopicMissing,
    #[error("unresolved wildcard in publish topic {0}")]
    UnresolvedTopicLevel(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// 组装单个实例。
///
/// 入站时 `topic_levels` 为源 topic 的层级；出站时 `_TOPIC_LEVEL_` 以 publish topic
/// 模式的层级为初值，替换写入后重新拼接为发布 topic。
pub fn assemble(
    ctx: &TenantContext,
    rule: &MappingRule,
    instance: &ReconciledInstance,
    topic_levels: &[String],
) -> Result<RequestDescriptor, AssemblyError> {
    if !rule.target_template.is_object() {
        return Err(AssemblyError::TemplateNotObject);
    }
    let initial_levels = match rule.direction {
        Direction::Inbound => topic_levels.to_vec(),
        Direction::Outbound => rule
            .publish_topic
            .as_deref()
            .map(split_topic)
            .ok_or(AssemblyError::PublishTopicMissing)?,
    };
    let mut body = rule.target_template.clone();
    if let Some(object) = body.as_object_mut() {
        object.insert(TOKEN_TOPIC_LEVEL.to_string(), Value::from(initial_levels));
    }

    let mut api = rule.target_api;
    let mut publish_override = None;
    let mut written = HashSet::new();
    for substitution in &rule.substitutions {
        let target = substitution.path_target.as_str();
        if !written.insert(target) || target.starts_with(TOKEN_IDENTITY) {
            continue;
        }
        let value = instance.get(target);
        if target.starts_with(TOKEN_CONTEXT_DATA) {
            apply_context_data(rule, target, value, &mut api, &mut publish_override);
            continue;
        }
        let strategy = substitution.repair_strategy;
        if removes(strategy, value) {
            path::remove(&mut body, target).map_err(|source| AssemblyError::Path {
                path: target.to_string(),
                source,
            })?;
            continue;
        }
        let Some(value) = value else {
            continue;
        };
        let create = matches!(strategy, RepairStrategy::CreateIfMissing);
        path::write(&mut body, target, value.typed_value(), create).map_err(|source| {
            AssemblyError::Path {
                path: target.to_string(),
                source,
            }
        })?;
    }

    // 设备标识写入最终 API 的标识字段
    if rule.direction == Direction::Inbound {
        if let Some(global_id) = &instance.global_id {
            let field = api.identifier();
            path::write(&mut body, field, Value::String(global_id.clone()), true).map_err(
                |source| AssemblyError::Path {
                    path: field.to_string(),
                    source,
                },
            )?;
        }
    }

    let levels = body
        .as_object_mut()
        .and_then(|object| object.remove(TOKEN_TOPIC_LEVEL));
    let publish_topic = match rule.direction {
        Direction::Inbound => None,
        Direction::Outbound => {
            let topic = publish_override.unwrap_or_else(|| join_levels(&level_texts(levels)));
            if split_topic(&topic).iter().any(|level| is_wildcard(level)) {
                return Err(AssemblyError::UnresolvedTopicLevel(topic));
            }
            Some(topic)
        }
    };

    let body =
        serde_json::to_string(&body).map_err(|err| AssemblyError::Serialize(err.to_string()))?;
    Ok(RequestDescriptor {
        tenant_id: ctx.tenant_id.clone(),
        mapping_id: rule.id.clone(),
        direction: rule.direction,
        api,
        source_id: instance.global_id.clone(),
        external_id: instance.external_id.clone(),
        body,
        publish_topic,
        instance_index: instance.index,
    })
}

fn removes(strategy: RepairStrategy, value: Option<&SubstituteValue>) -> bool {
    match (strategy, value) {
        (RepairStrategy::RemoveIfMissing, None) => true,
        (RepairStrategy::RemoveIfMissingOrNull, None) => true,
        (RepairStrategy::RemoveIfMissingOrNull, Some(value)) => value.is_null(),
        _ => false,
    }
}

fn apply_context_data(
    rule: &MappingRule,
    target: &str,
    value: Option<&SubstituteValue>,
    api: &mut TargetApi,
    publish_override: &mut Option<String>,
) {
    let Some(text) = value.and_then(SubstituteValue::as_text) else {
        return;
    };
    if target == CONTEXT_DATA_API {
        match TargetApi::parse(&text) {
            Some(parsed) => *api = parsed,
            None => warn!(
                target: "mapper.pipeline",
                mapping_id = %rule.id,
                api = %text,
                "context_api_ignored"
            ),
        }
    } else if target == CONTEXT_DATA_PUBLISH_TOPIC {
        *publish_override = Some(text);
    }
}

fn level_texts(levels: Option<Value>) -> Vec<String> {
    let Some(Value::Array(levels)) = levels else {
        return Vec::new();
    };
    levels
        .into_iter()
        .map(|level| match level {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect()
}
