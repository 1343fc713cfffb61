/// 缓存及其协作方错误。
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("lock failed")]
    Lock,
    #[error("lookup error: {0}")]
    Lookup(String),
    #[error("lookup limiter closed")]
    LimiterClosed,
}
