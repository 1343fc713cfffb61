//! 租户映射注册表。
//!
//! 每个租户持有入站前缀树、出站规则表、外部 ID 缓存与设备属性缓存。
//! 读取方拿到不可变快照后释放锁；增量修改在写锁内写时复制，批量重建整体替换快照。

use crate::error::ResolveError;
use crate::tree::MappingTree;
use dashmap::DashMap;
use domain::{Direction, MappingRule, TargetApi, TenantContext, path};
use mapper_cache::{
    CacheSettings, EvictionListener, IdentityResolver, IdentityService, InventoryProvider,
    InventoryService,
};
use mapping_contract::{ValidationError, validate_mapping};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// 出站规则表（按插入顺序）。
#[derive(Debug, Clone, Default)]
pub struct OutboundMappings {
    order: Vec<String>,
    rules: HashMap<String, Arc<MappingRule>>,
}

impl OutboundMappings {
    fn insert(&mut self, rule: Arc<MappingRule>) {
        if !self.rules.contains_key(&rule.id) {
            self.order.push(rule.id.clone());
        }
        self.rules.insert(rule.id.clone(), rule);
    }

    fn remove(&mut self, mapping_id: &str) -> Option<Arc<MappingRule>> {
        let removed = self.rules.remove(mapping_id)?;
        self.order.retain(|id| id != mapping_id);
        Some(removed)
    }

    /// 按 API 类型与过滤路径匹配：过滤路径必须存在于通知载荷中，未设置过滤则匹配全部。
    pub fn resolve(&self, api: TargetApi, payload: &serde_json::Value) -> Vec<Arc<MappingRule>> {
        self.order
            .iter()
            .filter_map(|id| self.rules.get(id))
            .filter(|rule| rule.active && rule.target_api == api)
            .filter(|rule| match rule.filter_mapping.as_deref() {
                Some(filter) if !filter.trim().is_empty() => path::exists(payload, filter),
                _ => true,
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 单个租户的映射与缓存状态。
pub struct TenantMappings {
    inbound: RwLock<Arc<MappingTree>>,
    outbound: RwLock<Arc<OutboundMappings>>,
    identity: Arc<IdentityService>,
    inventory: Arc<InventoryService>,
}

impl TenantMappings {
    pub fn inbound_snapshot(&self) -> Result<Arc<MappingTree>, ResolveError> {
        self.inbound
            .read()
            .map(|tree| tree.clone())
            .map_err(|_| ResolveError::Lock)
    }

    pub fn outbound_snapshot(&self) -> Result<Arc<OutboundMappings>, ResolveError> {
        self.outbound
            .read()
            .map(|table| table.clone())
            .map_err(|_| ResolveError::Lock)
    }

    pub fn identity(&self) -> Arc<IdentityService> {
        self.identity.clone()
    }

    pub fn inventory(&self) -> Arc<InventoryService> {
        self.inventory.clone()
    }
}

/// 批量重建时被拒绝的规则。
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMapping {
    pub mapping_id: String,
    pub errors: Vec<ValidationError>,
}

/// 映射注册表：租户生命周期显式管理。
pub struct MappingCacheManager {
    tenants: DashMap<String, Arc<TenantMappings>>,
    settings: CacheSettings,
    resolver: Arc<dyn IdentityResolver>,
    provider: Arc<dyn InventoryProvider>,
    eviction_listener: Option<EvictionListener>,
}

impl MappingCacheManager {
    pub fn new(
        settings: CacheSettings,
        resolver: Arc<dyn IdentityResolver>,
        provider: Arc<dyn InventoryProvider>,
    ) -> Self {
        Self {
            tenants: DashMap::new(),
            settings,
            resolver,
            provider,
            eviction_listener: None,
        }
    }

    pub fn with_eviction_listener(mut self, listener: EvictionListener) -> Self {
        self.eviction_listener = Some(listener);
        self
    }

    /// 创建租户状态（已存在时返回现有状态）。
    pub fn create_tenant(&self, tenant_id: &str) -> Arc<TenantMappings> {
        self.tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                info!(target: "mapper.resolve", tenant_id, "tenant_created");
                Arc::new(TenantMappings {
                    inbound: RwLock::new(Arc::new(MappingTree::new())),
                    outbound: RwLock::new(Arc::new(OutboundMappings::default())),
                    identity: Arc::new(IdentityService::new(&self.settings, self.resolver.clone())),
                    inventory: Arc::new(InventoryService::new(
                        &self.settings,
                        self.provider.clone(),
                        self.eviction_listener.clone(),
                    )),
                })
            })
            .clone()
    }

    /// 移除租户并清空其缓存。
    pub fn remove_tenant(&self, tenant_id: &str) -> bool {
        let Some((_, tenant)) = self.tenants.remove(tenant_id) else {
            return false;
        };
        if let Err(err) = tenant.identity.clear() {
            warn!(target: "mapper.resolve", tenant_id, error = %err, "external_id_cache_clear_failed");
        }
        if let Err(err) = tenant.inventory.clear() {
            warn!(target: "mapper.resolve", tenant_id, error = %err, "inventory_cache_clear_failed");
        }
        info!(target: "mapper.resolve", tenant_id, "tenant_removed");
        true
    }

    /// 清空租户的规则表与缓存，保留租户注册。
    pub fn clear_tenant(&self, ctx: &TenantContext) -> Result<(), ResolveError> {
        let tenant = self.tenant(ctx)?;
        *tenant.inbound.write().map_err(|_| ResolveError::Lock)? = Arc::new(MappingTree::new());
        *tenant.outbound.write().map_err(|_| ResolveError::Lock)? =
            Arc::new(OutboundMappings::default());
        tenant
            .identity
            .clear()
            .map_err(|_| ResolveError::Lock)?;
        tenant
            .inventory
            .clear()
            .map_err(|_| ResolveError::Lock)?;
        info!(target: "mapper.resolve", tenant_id = %ctx.tenant_id, "tenant_cleared");
        Ok(())
    }

    pub fn tenant(&self, ctx: &TenantContext) -> Result<Arc<TenantMappings>, ResolveError> {
        self.tenants
            .get(&ctx.tenant_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ResolveError::UnknownTenant(ctx.tenant_id.clone()))
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.tenants.iter().map(|entry| entry.key().clone()).collect()
    }

    /// 校验并新增（或替换同 ID）规则。
    pub fn add_mapping(&self, ctx: &TenantContext, mut rule: MappingRule) -> Result<(), ResolveError> {
        let errors = validate_mapping(&rule);
        if !errors.is_empty() {
            return Err(ResolveError::Invalid {
                mapping_id: rule.id,
                errors,
            });
        }
        let tenant = self.tenant(ctx)?;
        rule.deployed = true;
        let rule = Arc::new(rule);
        // 同一 ID 可能改变方向，先从另一张表移除。
        match rule.direction {
            Direction::Inbound => {
                let mut outbound = tenant.outbound.write().map_err(|_| ResolveError::Lock)?;
                if outbound.rules.contains_key(&rule.id) {
                    Arc::make_mut(&mut outbound).remove(&rule.id);
                }
                drop(outbound);
                let mut inbound = tenant.inbound.write().map_err(|_| ResolveError::Lock)?;
                Arc::make_mut(&mut inbound).add_mapping(rule.clone())?;
            }
            Direction::Outbound => {
                let mut inbound = tenant.inbound.write().map_err(|_| ResolveError::Lock)?;
                if inbound.get(&rule.id).is_some() {
                    Arc::make_mut(&mut inbound).delete_mapping(&rule.id);
                }
                drop(inbound);
                let mut outbound = tenant.outbound.write().map_err(|_| ResolveError::Lock)?;
                Arc::make_mut(&mut outbound).insert(rule.clone());
            }
        }
        debug!(
            target: "mapper.resolve",
            tenant_id = %ctx.tenant_id,
            mapping_id = %rule.id,
            topic = %rule.subscription_topic,
            "mapping_added"
        );
        Ok(())
    }

    pub fn delete_mapping(
        &self,
        ctx: &TenantContext,
        mapping_id: &str,
    ) -> Result<Option<Arc<MappingRule>>, ResolveError> {
        let tenant = self.tenant(ctx)?;
        let removed = {
            let mut inbound = tenant.inbound.write().map_err(|_| ResolveError::Lock)?;
            if inbound.get(mapping_id).is_some() {
                Arc::make_mut(&mut inbound).delete_mapping(mapping_id)
            } else {
                None
            }
        };
        let removed = match removed {
            Some(rule) => Some(rule),
            None => {
                let mut outbound = tenant.outbound.write().map_err(|_| ResolveError::Lock)?;
                if outbound.rules.contains_key(mapping_id) {
                    Arc::make_mut(&mut outbound).remove(mapping_id)
                } else {
                    None
                }
            }
        };
        if removed.is_some() {
            debug!(target: "mapper.resolve", tenant_id = %ctx.tenant_id, mapping_id, "mapping_deleted");
        }
        Ok(removed)
    }

    pub fn get_mapping(
        &self,
        ctx: &TenantContext,
        mapping_id: &str,
    ) -> Result<Option<Arc<MappingRule>>, ResolveError> {
        let tenant = self.tenant(ctx)?;
        if let Some(rule) = tenant.inbound_snapshot()?.get(mapping_id) {
            return Ok(Some(rule));
        }
        Ok(tenant.outbound_snapshot()?.rules.get(mapping_id).cloned())
    }

    pub fn contains_mapping(&self, ctx: &TenantContext, mapping_id: &str) -> Result<bool, ResolveError> {
        Ok(self.get_mapping(ctx, mapping_id)?.is_some())
    }

    /// 入站：按 topic 解析启用中的规则。
    ///
    /// 注册表中的规则均已部署，只需按 `active` 过滤。
    pub fn resolve_inbound(
        &self,
        ctx: &TenantContext,
        topic: &str,
    ) -> Result<Vec<Arc<MappingRule>>, ResolveError> {
        let tree = self.tenant(ctx)?.inbound_snapshot()?;
        let rules: Vec<_> = tree
            .resolve(topic)
            .into_iter()
            .filter(|rule| rule.active)
            .collect();
        debug!(
            target: "mapper.resolve",
            tenant_id = %ctx.tenant_id,
            topic,
            count = rules.len(),
            "mapping_resolved"
        );
        Ok(rules)
    }

    /// 出站：按 API 类型与过滤路径解析。
    pub fn resolve_outbound(
        &self,
        ctx: &TenantContext,
        api: TargetApi,
        payload: &serde_json::Value,
    ) -> Result<Vec<Arc<MappingRule>>, ResolveError> {
        Ok(self.tenant(ctx)?.outbound_snapshot()?.resolve(api, payload))
    }

    /// 用新规则集整体替换入站前缀树；非法规则被跳过并返回。
    pub fn rebuild_inbound(
        &self,
        ctx: &TenantContext,
        rules: Vec<MappingRule>,
    ) -> Result<Vec<RejectedMapping>, ResolveError> {
        let tenant = self.tenant(ctx)?;
        let (accepted, rejected) = partition_valid(rules, Direction::Inbound);
        let tree = MappingTree::build(accepted)?;
        let count = tree.len();
        *tenant.inbound.write().map_err(|_| ResolveError::Lock)? = Arc::new(tree);
        info!(
            target: "mapper.resolve",
            tenant_id = %ctx.tenant_id,
            mappings = count,
            rejected = rejected.len(),
            "inbound_rebuilt"
        );
        Ok(rejected)
    }

    pub fn rebuild_outbound(
        &self,
        ctx: &TenantContext,
        rules: Vec<MappingRule>,
    ) -> Result<Vec<RejectedMapping>, ResolveError> {
        let tenant = self.tenant(ctx)?;
        let (accepted, rejected) = partition_valid(rules, Direction::Outbound);
        let mut table = OutboundMappings::default();
        for rule in accepted {
            table.insert(rule);
        }
        let count = table.len();
        *tenant.outbound.write().map_err(|_| ResolveError::Lock)? = Arc::new(table);
        info!(
            target: "mapper.resolve",
            tenant_id = %ctx.tenant_id,
            mappings = count,
            rejected = rejected.len(),
            "outbound_rebuilt"
        );
        Ok(rejected)
    }

    /// 启用中入站规则的订阅 topic（去重，按字典序）。
    pub fn inbound_subscriptions(&self, ctx: &TenantContext) -> Result<Vec<String>, ResolveError> {
        let tree = self.tenant(ctx)?.inbound_snapshot()?;
        let mut topics: Vec<String> = tree
            .rules()
            .filter(|rule| rule.active)
            .map(|rule| rule.subscription_topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }
}

fn partition_valid(
    rules: Vec<MappingRule>,
    direction: Direction,
) -> (Vec<Arc<MappingRule>>, Vec<RejectedMapping>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for mut rule in rules.into_iter().filter(|rule| rule.direction == direction) {
        let errors = validate_mapping(&rule);
        if errors.is_empty() {
            rule.deployed = true;
            accepted.push(Arc::new(rule));
        } else {
            rejected.push(RejectedMapping {
                mapping_id: rule.id,
                errors,
            });
        }
    }
    (accepted, rejected)
}
