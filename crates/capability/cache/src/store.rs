//! 带容量与保留期的 LRU 存储。

use crate::error::CacheError;
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Timed<V> {
    value: V,
    inserted_at: Instant,
}

/// 容量为 0 时不存储任何条目。
pub(crate) struct TimedLru<K: Hash + Eq, V> {
    retention: Option<Duration>,
    entries: Option<Mutex<LruCache<K, Timed<V>>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> TimedLru<K, V> {
    pub(crate) fn new(capacity: usize, retention: Option<Duration>) -> Self {
        Self {
            retention,
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// 命中时刷新最近使用顺序；超出保留期的条目被移除并视为未命中。
    pub(crate) fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        let Some(entries) = &self.entries else {
            return Ok(None);
        };
        let mut entries = entries.lock().map_err(|_| CacheError::Lock)?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(timed) => self
                .retention
                .is_some_and(|retention| timed.inserted_at.elapsed() > retention),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|timed| timed.value.clone()))
    }

    /// 写入条目，返回因容量被淘汰的旧条目（覆盖同键不算淘汰）。
    pub(crate) fn put(&self, key: K, value: V) -> Result<Option<(K, V)>, CacheError> {
        let Some(entries) = &self.entries else {
            return Ok(None);
        };
        let mut entries = entries.lock().map_err(|_| CacheError::Lock)?;
        let timed = Timed {
            value,
            inserted_at: Instant::now(),
        };
        match entries.push(key.clone(), timed) {
            Some((evicted, old)) if evicted != key => Ok(Some((evicted, old.value))),
            _ => Ok(None),
        }
    }

    pub(crate) fn remove(&self, key: &K) -> Result<Option<V>, CacheError> {
        let Some(entries) = &self.entries else {
            return Ok(None);
        };
        let mut entries = entries.lock().map_err(|_| CacheError::Lock)?;
        Ok(entries.pop(key).map(|timed| timed.value))
    }

    pub(crate) fn drain(&self) -> Result<Vec<(K, V)>, CacheError> {
        let Some(entries) = &self.entries else {
            return Ok(Vec::new());
        };
        let mut entries = entries.lock().map_err(|_| CacheError::Lock)?;
        let mut drained = Vec::with_capacity(entries.len());
        while let Some((key, timed)) = entries.pop_lru() {
            drained.push((key, timed.value));
        }
        Ok(drained)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().ok().map(|entries| entries.len()))
            .unwrap_or(0)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|entries| entries.lock().ok().map(|entries| entries.cap().get()))
            .unwrap_or(0)
    }
}
