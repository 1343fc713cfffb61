//! 映射服务运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 映射服务运行配置。
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub tenant_id: String,
    pub connector_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_publish_qos: u8,
    pub mappings_file: Option<String>,
    /// 平台通知 topic；设置且启用出站时按出站方向处理。
    pub notification_topic: Option<String>,
    pub ingest_enabled: bool,
    /// 接入消息并发处理上限。
    pub ingest_max_in_flight: usize,
    pub outbound_enabled: bool,
    pub dry_run: bool,
    pub external_id_cache_size: usize,
    pub external_id_cache_retention_seconds: Option<u64>,
    pub inventory_cache_size: usize,
    pub inventory_cache_retention_seconds: Option<u64>,
    pub inventory_fragments: Vec<String>,
    pub identity_lookup_concurrency: usize,
    pub cpu_budget_ms: Option<u64>,
    pub log_payload: bool,
    pub dispatch_max_retries: u64,
    pub dispatch_backoff_ms: u64,
}

impl ServiceConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let tenant_id = env::var("MAPPER_TENANT").unwrap_or_else(|_| "t-default".to_string());
        let connector_id =
            env::var("MAPPER_CONNECTOR_ID").unwrap_or_else(|_| "mqtt-default".to_string());
        let mqtt_host = env::var("MAPPER_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("MAPPER_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("MAPPER_MQTT_USERNAME");
        let mqtt_password = read_optional("MAPPER_MQTT_PASSWORD");
        let mqtt_publish_qos = read_u8_with_default("MAPPER_MQTT_PUBLISH_QOS", 1)?;
        let mappings_file = read_optional("MAPPER_MAPPINGS_FILE");
        let notification_topic = read_optional("MAPPER_NOTIFICATION_TOPIC");
        let ingest_enabled = read_bool_with_default("MAPPER_INGEST", false);
        let ingest_max_in_flight =
            read_u64_with_default("MAPPER_INGEST_MAX_IN_FLIGHT", 32)?.max(1) as usize;
        let outbound_enabled = read_bool_with_default("MAPPER_OUTBOUND_ENABLED", true);
        let dry_run = read_bool_with_default("MAPPER_DRY_RUN", false);
        let external_id_cache_size =
            read_u64_with_default("MAPPER_EXTERNAL_ID_CACHE_SIZE", 10_000)? as usize;
        let external_id_cache_retention_seconds =
            read_optional_u64("MAPPER_EXTERNAL_ID_CACHE_RETENTION_SECONDS")?
                .filter(|value| *value > 0);
        let inventory_cache_size =
            read_u64_with_default("MAPPER_INVENTORY_CACHE_SIZE", 1_000)? as usize;
        let inventory_cache_retention_seconds =
            read_optional_u64("MAPPER_INVENTORY_CACHE_RETENTION_SECONDS")?
                .filter(|value| *value > 0);
        let inventory_fragments = read_list_with_default("MAPPER_INVENTORY_FRAGMENTS", "id,name,type");
        let identity_lookup_concurrency =
            read_u64_with_default("MAPPER_IDENTITY_LOOKUP_CONCURRENCY", 8)?.max(1) as usize;
        let cpu_budget_ms = read_optional_u64("MAPPER_CPU_BUDGET_MS")?.filter(|value| *value > 0);
        let log_payload = read_bool_with_default("MAPPER_LOG_PAYLOAD", false);
        let dispatch_max_retries = read_u64_with_default("MAPPER_DISPATCH_MAX_RETRIES", 2)?;
        let dispatch_backoff_ms = read_u64_with_default("MAPPER_DISPATCH_BACKOFF_MS", 200)?;

        Ok(Self {
            tenant_id,
            connector_id,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_publish_qos,
            mappings_file,
            notification_topic,
            ingest_enabled,
            ingest_max_in_flight,
            outbound_enabled,
            dry_run,
            external_id_cache_size,
            external_id_cache_retention_seconds,
            inventory_cache_size,
            inventory_cache_retention_seconds,
            inventory_fragments,
            identity_lookup_concurrency,
            cpu_budget_ms,
            log_payload,
            dispatch_max_retries,
            dispatch_backoff_ms,
        })
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u8_with_default(key: &str, default: u8) -> Result<u8, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u8>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}

/// 逗号分隔列表，去除空项。
fn read_list_with_default(key: &str, default: &str) -> Vec<String> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
