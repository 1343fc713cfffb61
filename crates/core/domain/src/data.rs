use crate::mapping::{Direction, TargetApi};

/// 传输层输入的原始消息。
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub tenant_id: String,
    pub connector_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at_ms: i64,
}

/// 平台侧通知（出站方向的输入）。
#[derive(Debug, Clone)]
pub struct PlatformNotification {
    pub tenant_id: String,
    pub api: TargetApi,
    /// 通知所属平台对象的全局 ID。
    pub source_id: String,
    pub payload: serde_json::Value,
    pub received_at_ms: i64,
}

/// 可下发的请求描述。
///
/// 由载荷组装产生，交给下发协作方执行实际网络调用、重试与确认。
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub tenant_id: String,
    pub mapping_id: String,
    pub direction: Direction,
    pub api: TargetApi,
    /// 已解析的平台全局 ID（入站）或通知来源 ID（出站）。
    pub source_id: Option<String>,
    pub external_id: Option<String>,
    pub body: String,
    /// 仅出站：回填 topic 层级后的发布 topic。
    pub publish_topic: Option<String>,
    /// 在本条规则扇出中的序号。
    pub instance_index: usize,
}
