//! 内存协作方实现
//!
//! 用于本地测试和独立运行。

use crate::error::CacheError;
use crate::external_id::ResolvedIdentity;
use crate::inventory::InventoryAttributes;
use crate::service::{IdentityResolver, InventoryProvider};
use async_trait::async_trait;
use domain::TenantContext;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

fn identity_key(tenant_id: &str, external_id_type: &str, external_id: &str) -> String {
    format!("tenant:{tenant_id}:type:{external_id_type}:id:{external_id}")
}

/// 内存身份表。
pub struct InMemoryIdentityResolver {
    global_ids: RwLock<HashMap<String, String>>,
    external_ids: RwLock<HashMap<String, String>>,
    lookups: AtomicUsize,
}

impl InMemoryIdentityResolver {
    pub fn new() -> Self {
        Self {
            global_ids: RwLock::new(HashMap::new()),
            external_ids: RwLock::new(HashMap::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn register(
        &self,
        tenant_id: &str,
        external_id_type: &str,
        external_id: &str,
        global_id: &str,
    ) -> Result<(), CacheError> {
        self.global_ids
            .write()
            .map_err(|_| CacheError::Lock)?
            .insert(
                identity_key(tenant_id, external_id_type, external_id),
                global_id.to_string(),
            );
        self.external_ids
            .write()
            .map_err(|_| CacheError::Lock)?
            .insert(
                identity_key(tenant_id, external_id_type, global_id),
                external_id.to_string(),
            );
        Ok(())
    }

    /// 协作方被调用的次数（用于测试缓存命中）。
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryIdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityResolver for InMemoryIdentityResolver {
    async fn lookup_global_id(
        &self,
        ctx: &TenantContext,
        external_id_type: &str,
        external_id: &str,
    ) -> Result<Option<ResolvedIdentity>, CacheError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let global_ids = self.global_ids.read().map_err(|_| CacheError::Lock)?;
        Ok(global_ids
            .get(&identity_key(&ctx.tenant_id, external_id_type, external_id))
            .map(ResolvedIdentity::new))
    }

    async fn lookup_external_id(
        &self,
        ctx: &TenantContext,
        global_id: &str,
        external_id_type: &str,
    ) -> Result<Option<String>, CacheError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let external_ids = self.external_ids.read().map_err(|_| CacheError::Lock)?;
        Ok(external_ids
            .get(&identity_key(&ctx.tenant_id, external_id_type, global_id))
            .cloned())
    }
}

/// 内存设备属性表。
pub struct InMemoryInventoryProvider {
    attributes: RwLock<HashMap<String, InventoryAttributes>>,
}

impl InMemoryInventoryProvider {
    pub fn new() -> Self {
        Self {
            attributes: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        tenant_id: &str,
        source_id: &str,
        attributes: InventoryAttributes,
    ) -> Result<(), CacheError> {
        self.attributes
            .write()
            .map_err(|_| CacheError::Lock)?
            .insert(format!("tenant:{tenant_id}:source:{source_id}"), attributes);
        Ok(())
    }
}

impl Default for InMemoryInventoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryProvider for InMemoryInventoryProvider {
    async fn fetch_attributes(
        &self,
        ctx: &TenantContext,
        source_id: &str,
    ) -> Result<Option<InventoryAttributes>, CacheError> {
        let attributes = self.attributes.read().map_err(|_| CacheError::Lock)?;
        Ok(attributes
            .get(&format!("tenant:{}:source:{}", ctx.tenant_id, source_id))
            .cloned())
    }
}
