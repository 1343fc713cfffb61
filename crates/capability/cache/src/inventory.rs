//! 设备属性缓存：source id → 属性集合。

use crate::error::CacheError;
use crate::store::TimedLru;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

pub type InventoryAttributes = Map<String, Value>;

/// 条目被移除（容量淘汰或显式失效）时的回调。
pub type EvictionListener = Arc<dyn Fn(&str, &InventoryAttributes) + Send + Sync>;

/// 租户级设备属性缓存。
pub struct InventoryCache {
    store: TimedLru<String, Arc<InventoryAttributes>>,
    listener: Option<EvictionListener>,
}

impl InventoryCache {
    pub fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            store: TimedLru::new(capacity, retention),
            listener: None,
        }
    }

    pub fn with_eviction_listener(mut self, listener: EvictionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn get(&self, source_id: &str) -> Result<Option<Arc<InventoryAttributes>>, CacheError> {
        self.store.get(&source_id.to_string())
    }

    pub fn insert(
        &self,
        source_id: impl Into<String>,
        attributes: InventoryAttributes,
    ) -> Result<Arc<InventoryAttributes>, CacheError> {
        let attributes = Arc::new(attributes);
        if let Some((evicted, old)) = self.store.put(source_id.into(), attributes.clone())? {
            self.notify(&evicted, &old);
        }
        Ok(attributes)
    }

    pub fn invalidate(&self, source_id: &str) -> Result<bool, CacheError> {
        match self.store.remove(&source_id.to_string())? {
            Some(old) => {
                self.notify(source_id, &old);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        self.store.drain().map(|_| ())
    }

    pub fn size(&self) -> usize {
        self.store.len()
    }

    fn notify(&self, source_id: &str, attributes: &InventoryAttributes) {
        if let Some(listener) = &self.listener {
            listener(source_id, attributes);
        }
    }
}
