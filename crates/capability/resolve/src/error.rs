use mapping_contract::ValidationError;

/// 映射解析与注册表错误。
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("mapping {mapping_id} rejected: {errors:?}")]
    Invalid {
        mapping_id: String,
        errors: Vec<ValidationError>,
    },
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
    #[error("lock failed")]
    Lock,
}
