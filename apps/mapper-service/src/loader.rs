//! 启动时加载映射文档：预置身份与设备属性，整体重建入站/出站规则表。

use domain::{Direction, TenantContext};
use mapper_cache::{CacheError, InMemoryIdentityResolver, InMemoryInventoryProvider};
use mapper_resolve::{MappingCacheManager, RejectedMapping, ResolveError};
use mapping_contract::MappingDocument;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read mapping document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse mapping document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

pub fn load_mapping_document(
    path: &str,
    ctx: &TenantContext,
    manager: &MappingCacheManager,
    resolver: &InMemoryIdentityResolver,
    inventory: &InMemoryInventoryProvider,
) -> Result<(), LoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_string(),
        source,
    })?;
    let document = MappingDocument::from_json(&raw)?;
    if let Some(tenant) = document.tenant.as_deref() {
        if tenant != ctx.tenant_id {
            warn!(
                target: "mapper.service",
                tenant_id = %ctx.tenant_id,
                document_tenant = tenant,
                "mapping_document_tenant_mismatch"
            );
        }
    }

    for seed in &document.identities {
        resolver.register(
            &ctx.tenant_id,
            &seed.external_id_type,
            &seed.external_id,
            &seed.global_id,
        )?;
    }
    for seed in &document.inventory {
        inventory.register(&ctx.tenant_id, &seed.source_id, seed.attributes.clone())?;
    }

    let (inbound, outbound): (Vec<_>, Vec<_>) = document
        .mappings
        .into_iter()
        .partition(|rule| rule.direction == Direction::Inbound);
    let mut rejected = manager.rebuild_inbound(ctx, inbound)?;
    rejected.extend(manager.rebuild_outbound(ctx, outbound)?);
    for RejectedMapping { mapping_id, errors } in &rejected {
        let codes: Vec<&str> = errors.iter().map(|error| error.code()).collect();
        warn!(
            target: "mapper.service",
            tenant_id = %ctx.tenant_id,
            mapping_id = %mapping_id,
            codes = ?codes,
            "mapping_rejected"
        );
    }
    info!(
        target: "mapper.service",
        tenant_id = %ctx.tenant_id,
        path,
        identities = document.identities.len(),
        inventory = document.inventory.len(),
        rejected = rejected.len(),
        "mapping_document_loaded"
    );
    Ok(())
}
