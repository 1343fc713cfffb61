//! 协作方接口与带缓存的解析服务。

use crate::error::CacheError;
use crate::external_id::{ExternalIdCache, ExternalIdKey, ResolvedIdentity};
use crate::inventory::{InventoryAttributes, InventoryCache};
use async_trait::async_trait;
use domain::TenantContext;
use mapper_telemetry::{CacheKind, CacheSizeGauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// 平台身份查询协作方。
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn lookup_global_id(
        &self,
        ctx: &TenantContext,
        external_id_type: &str,
        external_id: &str,
    ) -> Result<Option<ResolvedIdentity>, CacheError>;

    async fn lookup_external_id(
        &self,
        ctx: &TenantContext,
        global_id: &str,
        external_id_type: &str,
    ) -> Result<Option<String>, CacheError>;
}

/// 平台设备属性查询协作方。
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn fetch_attributes(
        &self,
        ctx: &TenantContext,
        source_id: &str,
    ) -> Result<Option<InventoryAttributes>, CacheError>;
}

/// 始终未命中的占位实现。
pub struct NoopIdentityResolver;

#[async_trait]
impl IdentityResolver for NoopIdentityResolver {
    async fn lookup_global_id(
        &self,
        _ctx: &TenantContext,
        _external_id_type: &str,
        _external_id: &str,
    ) -> Result<Option<ResolvedIdentity>, CacheError> {
        Ok(None)
    }

    async fn lookup_external_id(
        &self,
        _ctx: &TenantContext,
        _global_id: &str,
        _external_id_type: &str,
    ) -> Result<Option<String>, CacheError> {
        Ok(None)
    }
}

pub struct NoopInventoryProvider;

#[async_trait]
impl InventoryProvider for NoopInventoryProvider {
    async fn fetch_attributes(
        &self,
        _ctx: &TenantContext,
        _source_id: &str,
    ) -> Result<Option<InventoryAttributes>, CacheError> {
        Ok(None)
    }
}

/// 租户级缓存配置。
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub external_id_capacity: usize,
    pub external_id_retention: Option<Duration>,
    pub inventory_capacity: usize,
    pub inventory_retention: Option<Duration>,
    /// 属性白名单；为空时保留全部属性。
    pub inventory_fragments: Vec<String>,
    /// 同时进行的身份查询上限。
    pub lookup_concurrency: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            external_id_capacity: 10_000,
            external_id_retention: None,
            inventory_capacity: 1_000,
            inventory_retention: None,
            inventory_fragments: vec!["id".to_string(), "name".to_string(), "type".to_string()],
            lookup_concurrency: 8,
        }
    }
}

/// 外部 ID 解析服务：缓存命中直接返回，未命中时限流查询协作方并回填。
pub struct IdentityService {
    cache: ExternalIdCache,
    resolver: Arc<dyn IdentityResolver>,
    permits: Semaphore,
    gauge: CacheSizeGauge,
}

impl IdentityService {
    pub fn new(settings: &CacheSettings, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            cache: ExternalIdCache::new(
                settings.external_id_capacity,
                settings.external_id_retention,
            ),
            resolver,
            permits: Semaphore::new(settings.lookup_concurrency.max(1)),
            gauge: CacheSizeGauge::new(CacheKind::ExternalId),
        }
    }

    /// 解析外部 ID；查询失败按未找到处理，由调用方决定是否致命。
    pub async fn resolve(
        &self,
        ctx: &TenantContext,
        external_id_type: &str,
        external_id: &str,
    ) -> Option<ResolvedIdentity> {
        let key = ExternalIdKey::new(external_id_type, external_id);
        match self.cache.get(&key) {
            Ok(Some(identity)) => return Some(identity),
            Ok(None) => {}
            Err(err) => {
                warn!(target: "mapper.cache", tenant_id = %ctx.tenant_id, error = %err, "external_id_cache_read_failed");
            }
        }

        let resolved = match self.lookup(ctx, external_id_type, external_id).await {
            Ok(resolved) => resolved?,
            Err(err) => {
                warn!(
                    target: "mapper.cache",
                    tenant_id = %ctx.tenant_id,
                    external_id_type,
                    external_id,
                    error = %err,
                    "identity_lookup_failed"
                );
                return None;
            }
        };

        match self.cache.insert(key, resolved.clone()) {
            Ok(Some(evicted)) => {
                debug!(
                    target: "mapper.cache",
                    tenant_id = %ctx.tenant_id,
                    evicted = %evicted.external_id,
                    "external_id_evicted"
                );
            }
            Ok(None) => {}
            Err(err) => {
                warn!(target: "mapper.cache", tenant_id = %ctx.tenant_id, error = %err, "external_id_cache_write_failed");
            }
        }
        self.gauge.set(self.cache.size());
        Some(resolved)
    }

    async fn lookup(
        &self,
        ctx: &TenantContext,
        external_id_type: &str,
        external_id: &str,
    ) -> Result<Option<ResolvedIdentity>, CacheError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::LimiterClosed)?;
        self.resolver
            .lookup_global_id(ctx, external_id_type, external_id)
            .await
    }

    /// 全局 ID → 外部 ID（出站方向，不缓存）。
    pub async fn resolve_external(
        &self,
        ctx: &TenantContext,
        global_id: &str,
        external_id_type: &str,
    ) -> Option<String> {
        let _permit = self.permits.acquire().await.ok()?;
        match self
            .resolver
            .lookup_external_id(ctx, global_id, external_id_type)
            .await
        {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    target: "mapper.cache",
                    tenant_id = %ctx.tenant_id,
                    global_id,
                    error = %err,
                    "external_id_lookup_failed"
                );
                None
            }
        }
    }

    pub fn invalidate(&self, external_id_type: &str, external_id: &str) -> Result<bool, CacheError> {
        let removed = self
            .cache
            .invalidate(&ExternalIdKey::new(external_id_type, external_id))?;
        self.gauge.set(self.cache.size());
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.cache.clear()?;
        self.gauge.set(0);
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.cache.size()
    }
}

/// 设备属性服务：按白名单过滤协作方返回的属性并缓存。
pub struct InventoryService {
    cache: InventoryCache,
    provider: Arc<dyn InventoryProvider>,
    fragments: Vec<String>,
    gauge: CacheSizeGauge,
}

impl InventoryService {
    pub fn new(
        settings: &CacheSettings,
        provider: Arc<dyn InventoryProvider>,
        listener: Option<crate::inventory::EvictionListener>,
    ) -> Self {
        let mut cache = InventoryCache::new(settings.inventory_capacity, settings.inventory_retention);
        if let Some(listener) = listener {
            cache = cache.with_eviction_listener(listener);
        }
        Self {
            cache,
            provider,
            fragments: settings.inventory_fragments.clone(),
            gauge: CacheSizeGauge::new(CacheKind::Inventory),
        }
    }

    pub async fn attributes(
        &self,
        ctx: &TenantContext,
        source_id: &str,
    ) -> Option<Arc<InventoryAttributes>> {
        if let Ok(Some(cached)) = self.cache.get(source_id) {
            return Some(cached);
        }
        let fetched = match self.provider.fetch_attributes(ctx, source_id).await {
            Ok(fetched) => fetched?,
            Err(err) => {
                warn!(
                    target: "mapper.cache",
                    tenant_id = %ctx.tenant_id,
                    source_id,
                    error = %err,
                    "inventory_lookup_failed"
                );
                return None;
            }
        };
        self.store(ctx, source_id, fetched)
    }

    /// 外部更新通知：替换缓存条目。
    pub fn update(
        &self,
        ctx: &TenantContext,
        source_id: &str,
        attributes: InventoryAttributes,
    ) -> Option<Arc<InventoryAttributes>> {
        self.store(ctx, source_id, attributes)
    }

    fn store(
        &self,
        ctx: &TenantContext,
        source_id: &str,
        attributes: InventoryAttributes,
    ) -> Option<Arc<InventoryAttributes>> {
        let filtered = self.filter(attributes);
        let stored = match self.cache.insert(source_id, filtered.clone()) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(target: "mapper.cache", tenant_id = %ctx.tenant_id, error = %err, "inventory_cache_write_failed");
                Arc::new(filtered)
            }
        };
        self.gauge.set(self.cache.size());
        Some(stored)
    }

    fn filter(&self, attributes: InventoryAttributes) -> InventoryAttributes {
        if self.fragments.is_empty() {
            return attributes;
        }
        attributes
            .into_iter()
            .filter(|(name, _)| self.fragments.iter().any(|fragment| fragment == name))
            .collect()
    }

    pub fn invalidate(&self, source_id: &str) -> Result<bool, CacheError> {
        let removed = self.cache.invalidate(source_id)?;
        self.gauge.set(self.cache.size());
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.cache.clear()?;
        self.gauge.set(0);
        Ok(())
    }

    pub fn cache_size(&self) -> usize {
        self.cache.size()
    }
}
