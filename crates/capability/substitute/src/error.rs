/// 提取与替换错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubstituteError {
    /// 无设备条目或上游提取失败：该规则跳过。
    #[error("extraction error: {0}")]
    Extraction(String),
    /// 设备标识无法解析为平台 ID：仅该实例失败。
    #[error("identifier resolution error: {external_id_type}/{external_id}")]
    IdentifierResolution {
        external_id_type: String,
        external_id: String,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
