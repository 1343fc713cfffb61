//! 外部 ID 缓存：(外部 ID 类型, 外部 ID) → 平台全局 ID。

use crate::error::CacheError;
use crate::store::TimedLru;
use std::time::Duration;

/// 缓存键。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalIdKey {
    pub external_id_type: String,
    pub external_id: String,
}

impl ExternalIdKey {
    pub fn new(external_id_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            external_id_type: external_id_type.into(),
            external_id: external_id.into(),
        }
    }
}

/// 已解析的设备身份。
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedIdentity {
    pub global_id: String,
    /// 平台对象表示（后续确认/回执使用）。
    pub representation: Option<serde_json::Value>,
}

impl ResolvedIdentity {
    pub fn new(global_id: impl Into<String>) -> Self {
        Self {
            global_id: global_id.into(),
            representation: None,
        }
    }
}

/// 租户级外部 ID 缓存。
pub struct ExternalIdCache {
    store: TimedLru<ExternalIdKey, ResolvedIdentity>,
}

impl ExternalIdCache {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            store: TimedLru::new(capacity, retention),
        }
    }

    pub fn get(&self, key: &ExternalIdKey) -> Result<Option<ResolvedIdentity>, CacheError> {
        self.store.get(key)
    }

    /// 写入解析结果，返回被淘汰的键。
    pub fn insert(
        &self,
        key: ExternalIdKey,
        identity: ResolvedIdentity,
    ) -> Result<Option<ExternalIdKey>, CacheError> {
        Ok(self.store.put(key, identity)?.map(|(evicted, _)| evicted))
    }

    pub fn invalidate(&self, key: &ExternalIdKey) -> Result<bool, CacheError> {
        Ok(self.store.remove(key)?.is_some())
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.drain().map(|_| ())
    }

    pub fn size(&self) -> usize {
        self.store.len()
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }
}
