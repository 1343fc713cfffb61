//! 映射服务：加载映射文档，接入 MQTT 消息，按租户规则映射后下发。

mod ingest;
mod loader;

use domain::TenantContext;
use mapper_cache::{
    CacheSettings, EvictionListener, InMemoryIdentityResolver, InMemoryInventoryProvider,
    InventoryAttributes,
};
use mapper_config::ServiceConfig;
use mapper_dispatch::{LogDispatcher, MqttPublisher, MqttPublisherConfig};
use mapper_pipeline::{MappingProcessor, ProcessorConfig};
use mapper_resolve::MappingCacheManager;
use mapper_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = ServiceConfig::from_env()?;
    init_tracing();

    // 内存协作方：由映射文档预置身份与设备属性
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    let inventory = Arc::new(InMemoryInventoryProvider::new());
    let listener: EvictionListener = Arc::new(|source_id: &str, _attributes: &InventoryAttributes| {
        debug!(target: "mapper.cache", source_id, "inventory_evicted");
    });
    let manager = Arc::new(
        MappingCacheManager::new(cache_settings(&config), resolver.clone(), inventory.clone())
            .with_eviction_listener(listener),
    );
    manager.create_tenant(&config.tenant_id);
    let ctx = TenantContext::new(config.tenant_id.clone())
        .with_connector(config.connector_id.clone())
        .with_dry_run(config.dry_run);

    if let Some(path) = config.mappings_file.as_deref() {
        loader::load_mapping_document(path, &ctx, &manager, &resolver, &inventory)?;
    }

    let processor_config = ProcessorConfig {
        outbound_enabled: config.outbound_enabled,
        cpu_budget: config.cpu_budget_ms.map(Duration::from_millis),
        log_payload: config.log_payload,
        dispatch_max_retries: config.dispatch_max_retries,
        dispatch_backoff_ms: config.dispatch_backoff_ms,
    };
    let mut processor =
        MappingProcessor::new(manager.clone(), Arc::new(LogDispatcher::new(config.log_payload)))
            .with_config(processor_config);

    // 出站请求发布到 broker
    let mut publisher_task = None;
    if config.outbound_enabled && config.ingest_enabled {
        let (publisher, handle) = MqttPublisher::connect(MqttPublisherConfig {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            qos: config.mqtt_publish_qos,
        })?;
        processor = processor.with_outbound_dispatcher(Arc::new(publisher));
        publisher_task = Some(handle);
    }

    let ingest_task = ingest::spawn_ingest(&config, ctx, processor)?;
    ingest_task.await?;
    if let Some(handle) = publisher_task {
        handle.abort();
    }
    info!(target: "mapper.service", metrics = ?metrics().snapshot(), "service_stopped");
    Ok(())
}

fn cache_settings(config: &ServiceConfig) -> CacheSettings {
    CacheSettings {
        external_id_capacity: config.external_id_cache_size,
        external_id_retention: config
            .external_id_cache_retention_seconds
            .map(Duration::from_secs),
        inventory_capacity: config.inventory_cache_size,
        inventory_retention: config
            .inventory_cache_retention_seconds
            .map(Duration::from_secs),
        inventory_fragments: config.inventory_fragments.clone(),
        lookup_concurrency: config.identity_lookup_concurrency,
    }
}
