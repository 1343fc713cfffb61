//! 替换/修复引擎：对齐各目标路径的值列表基数，产出按设备拆分的实例。

use crate::error::SubstituteError;
use domain::{Direction, MappingRule, ProcessingCache, RepairStrategy, SubstituteValue, TenantContext};
use mapper_cache::IdentityService;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 单个设备的对齐结果：目标路径 → 单值。
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledInstance {
    pub index: usize,
    pub values: BTreeMap<String, SubstituteValue>,
    /// 已解析的平台全局 ID（演练模式下可能为原始值）。
    pub global_id: Option<String>,
    pub external_id: Option<String>,
}

impl ReconciledInstance {
    fn new(index: usize) -> Self {
        Self {
            index,
            values: BTreeMap::new(),
            global_id: None,
            external_id: None,
        }
    }

    pub fn get(&self, path: &str) -> Option<&SubstituteValue> {
        self.values.get(path)
    }
}

/// 单实例结果：标识解析失败只影响该实例。
pub type InstanceOutcome = Result<ReconciledInstance, SubstituteError>;

/// 基数对齐（纯计算）。
///
/// 设备路径的列表长度为 N；较短列表按修复策略广播，空列表在所有实例中缺省，较长列表截断到 N。
pub fn reconcile_cardinality(
    rule: &MappingRule,
    cache: &ProcessingCache,
) -> Result<Vec<ReconciledInstance>, SubstituteError> {
    let device_path = rule.fan_out_path();
    let count = match device_path {
        Some(path) => cache.len_of(path),
        None => cache.max_len().max(1),
    };
    if count == 0 {
        return Err(SubstituteError::Extraction(
            "no device entries found".to_string(),
        ));
    }

    let mut instances: Vec<ReconciledInstance> = (0..count).map(ReconciledInstance::new).collect();
    for (path, values) in cache.iter() {
        if values.is_empty() {
            continue;
        }
        if values.len() >= count {
            if values.len() > count {
                debug!(
                    target: "mapper.substitute",
                    mapping_id = %rule.id,
                    path,
                    entries = values.len(),
                    devices = count,
                    "substitution_truncated"
                );
            }
            for (instance, value) in instances.iter_mut().zip(values) {
                instance.values.insert(path.to_string(), value.clone());
            }
            continue;
        }

        let strategy = rule.repair_strategy_for(path);
        let (chosen, recognized) = match strategy {
            RepairStrategy::Default | RepairStrategy::UseFirstValueOfArray => (&values[0], true),
            RepairStrategy::UseLastValueOfArray => (&values[values.len() - 1], true),
            _ => (&values[0], false),
        };
        if recognized {
            warn!(
                target: "mapper.substitute",
                mapping_id = %rule.id,
                path,
                strategy = ?strategy,
                entries = values.len(),
                devices = count,
                "substitution_repaired"
            );
        } else {
            warn!(
                target: "mapper.substitute",
                mapping_id = %rule.id,
                path,
                strategy = ?strategy,
                entries = values.len(),
                devices = count,
                "substitution_repair_degraded"
            );
        }
        mapper_telemetry::record_repair();
        for instance in &mut instances {
            instance.values.insert(path.to_string(), chosen.clone());
        }
    }
    Ok(instances)
}

/// 替换引擎：基数对齐后解析设备标识。
pub struct SubstitutionEngine;

impl SubstitutionEngine {
    /// 规则级失败返回 `Err`；实例级失败放入对应的 [`InstanceOutcome`]。
    pub async fn reconcile(
        ctx: &TenantContext,
        rule: &MappingRule,
        cache: &ProcessingCache,
        identity: &IdentityService,
    ) -> Result<Vec<InstanceOutcome>, SubstituteError> {
        let instances = reconcile_cardinality(rule, cache)?;
        let mut outcomes = Vec::with_capacity(instances.len());
        for instance in instances {
            outcomes.push(Self::resolve_identifier(ctx, rule, instance, identity).await);
        }
        Ok(outcomes)
    }

    async fn resolve_identifier(
        ctx: &TenantContext,
        rule: &MappingRule,
        mut instance: ReconciledInstance,
        identity: &IdentityService,
    ) -> InstanceOutcome {
        let Some(device_path) = rule.fan_out_path() else {
            return Ok(instance);
        };
        let raw = instance
            .values
            .get(device_path)
            .and_then(SubstituteValue::as_text);

        match rule.direction {
            Direction::Outbound => {
                instance.external_id = raw;
                Ok(instance)
            }
            Direction::Inbound if !rule.map_device_identifier => {
                instance.global_id = raw;
                Ok(instance)
            }
            Direction::Inbound => {
                let external_id = raw.unwrap_or_default();
                instance.external_id = Some(external_id.clone());
                let resolved = if external_id.is_empty() {
                    None
                } else {
                    identity
                        .resolve(ctx, &rule.external_id_type, &external_id)
                        .await
                };
                match resolved {
                    Some(resolved) => {
                        instance.global_id = Some(resolved.global_id);
                        Ok(instance)
                    }
                    None if ctx.dry_run => {
                        debug!(
                            target: "mapper.substitute",
                            tenant_id = %ctx.tenant_id,
                            mapping_id = %rule.id,
                            external_id = %external_id,
                            "identifier_passed_through"
                        );
                        instance.global_id = Some(external_id);
                        Ok(instance)
                    }
                    None => Err(SubstituteError::IdentifierResolution {
                        external_id_type: rule.external_id_type.clone(),
                        external_id,
                    }),
                }
            }
        }
    }
}
