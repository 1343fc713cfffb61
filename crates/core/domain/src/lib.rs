pub mod data;
pub mod mapping;
pub mod path;
pub mod topic;
pub mod value;

pub use data::{PlatformNotification, RawEvent, RequestDescriptor};
pub use mapping::{
    Direction, MappingRule, MappingType, RepairStrategy, Substitution, TargetApi,
    CONTEXT_DATA_API, CONTEXT_DATA_PUBLISH_TOPIC, IDENTITY_EXTERNAL_ID, IDENTITY_GLOBAL_ID,
    TOKEN_CONTEXT_DATA, TOKEN_IDENTITY, TOKEN_TOPIC_LEVEL,
};
pub use path::{PathError, PathSegment};
pub use topic::{TOPIC_WILDCARD_MULTI, TOPIC_WILDCARD_SINGLE};
pub use value::{ProcessingCache, SubstituteValue, ValueType};

/// 租户上下文：所有模块共享的执行上下文。
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
    pub connector_id: Option<String>,
    /// 测试/演练模式：外部 ID 未解析时原值透传，且不下发请求。
    pub dry_run: bool,
}

impl TenantContext {
    /// 构造指定租户的生产上下文。
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            connector_id: None,
            dry_run: false,
        }
    }

    pub fn with_connector(mut self, connector_id: impl Into<String>) -> Self {
        self.connector_id = Some(connector_id.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl Default for TenantContext {
    /// 空上下文（仅用于测试或占位）。
    fn default() -> Self {
        Self {
            tenant_id: "".to_string(),
            connector_id: None,
            dry_run: false,
        }
    }
}
