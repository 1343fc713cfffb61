//! 追踪初始化、请求 ID 生成与映射处理指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub raw_events: u64,
    pub notifications: u64,
    pub mappings_resolved: u64,
    pub messages_unmapped: u64,
    pub requests_emitted: u64,
    pub requests_dispatched: u64,
    pub dispatch_failures: u64,
    pub extraction_errors: u64,
    pub identifier_errors: u64,
    pub assembly_errors: u64,
    pub repairs: u64,
    pub budget_exceeded: u64,
    pub processing_latency_ms_total: u64,
    pub processing_latency_ms_count: u64,
    pub external_id_cache_size: u64,
    pub inventory_cache_size: u64,
}

/// 映射处理指标。计数器只增不减，缓存大小为各租户缓存之和。
pub struct TelemetryMetrics {
    raw_events: AtomicU64,
    notifications: AtomicU64,
    mappings_resolved: AtomicU64,
    messages_unmapped: AtomicU64,
    requests_emitted: AtomicU64,
    requests_dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    extraction_errors: AtomicU64,
    identifier_errors: AtomicU64,
    assembly_errors: AtomicU64,
    repairs: AtomicU64,
    budget_exceeded: AtomicU64,
    processing_latency_ms_total: AtomicU64,
    processing_latency_ms_count: AtomicU64,
    external_id_cache_size: AtomicU64,
    inventory_cache_size: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            raw_events: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            mappings_resolved: AtomicU64::new(0),
            messages_unmapped: AtomicU64::new(0),
            requests_emitted: AtomicU64::new(0),
            requests_dispatched: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            extraction_errors: AtomicU64::new(0),
            identifier_errors: AtomicU64::new(0),
            assembly_errors: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
            budget_exceeded: AtomicU64::new(0),
            processing_latency_ms_total: AtomicU64::new(0),
            processing_latency_ms_count: AtomicU64::new(0),
            external_id_cache_size: AtomicU64::new(0),
            inventory_cache_size: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            raw_events: self.raw_events.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            mappings_resolved: self.mappings_resolved.load(Ordering::Relaxed),
            messages_unmapped: self.messages_unmapped.load(Ordering::Relaxed),
            requests_emitted: self.requests_emitted.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            extraction_errors: self.extraction_errors.load(Ordering::Relaxed),
            identifier_errors: self.identifier_errors.load(Ordering::Relaxed),
            assembly_errors: self.assembly_errors.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
            budget_exceeded: self.budget_exceeded.load(Ordering::Relaxed),
            processing_latency_ms_total: self
                .processing_latency_ms_total
                .load(Ordering::Relaxed),
            processing_latency_ms_count: self
                .processing_latency_ms_count
                .load(Ordering::Relaxed),
            external_id_cache_size: self.external_id_cache_size.load(Ordering::Relaxed),
            inventory_cache_size: self.inventory_cache_size.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 记录入站原始消息接收次数。
pub fn record_raw_event() {
    metrics().raw_events.fetch_add(1, Ordering::Relaxed);
}

/// 记录出站平台通知接收次数。
pub fn record_notification() {
    metrics().notifications.fetch_add(1, Ordering::Relaxed);
}

/// 记录命中的映射规则数。
pub fn record_mappings_resolved(count: u64) {
    metrics()
        .mappings_resolved
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录未命中任何规则的消息。
pub fn record_message_unmapped() {
    metrics().messages_unmapped.fetch_add(1, Ordering::Relaxed);
}

/// 记录组装产出的请求数。
pub fn record_requests_emitted(count: u64) {
    metrics()
        .requests_emitted
        .fetch_add(count, Ordering::Relaxed);
}

pub fn record_request_dispatched() {
    metrics()
        .requests_dispatched
        .fetch_add(1, Ordering::Relaxed);
}

pub fn record_dispatch_failure() {
    metrics().dispatch_failures.fetch_add(1, Ordering::Relaxed);
}

pub fn record_extraction_error() {
    metrics().extraction_errors.fetch_add(1, Ordering::Relaxed);
}

pub fn record_identifier_error() {
    metrics().identifier_errors.fetch_add(1, Ordering::Relaxed);
}

pub fn record_assembly_error() {
    metrics().assembly_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录基数修复（广播/降级）次数。
pub fn record_repair() {
    metrics().repairs.fetch_add(1, Ordering::Relaxed);
}

/// 记录超出单消息处理预算的规则数。
pub fn record_budget_exceeded() {
    metrics().budget_exceeded.fetch_add(1, Ordering::Relaxed);
}

/// 记录单条消息处理耗时（毫秒）。
pub fn record_processing_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .processing_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .processing_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 缓存类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    ExternalId,
    Inventory,
}

/// 单个缓存实例的大小上报器。
///
/// 全局缓存大小为所有存活上报器最近一次上报值之和；上报器释放时扣除自身份额。
#[derive(Debug)]
pub struct CacheSizeGauge {
    kind: CacheKind,
    reported: AtomicU64,
}

impl CacheSizeGauge {
    pub fn new(kind: CacheKind) -> Self {
        Self {
            kind,
            reported: AtomicU64::new(0),
        }
    }

    pub fn set(&self, size: usize) {
        let size = size as u64;
        let previous = self.reported.swap(size, Ordering::Relaxed);
        let total = match self.kind {
            CacheKind::ExternalId => &metrics().external_id_cache_size,
            CacheKind::Inventory => &metrics().inventory_cache_size,
        };
        // 先加后减，总量不会下溢
        total.fetch_add(size, Ordering::Relaxed);
        total.fetch_sub(previous, Ordering::Relaxed);
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Relaxed)
    }
}

impl Drop for CacheSizeGauge {
    fn drop(&mut self) {
        self.set(0);
    }
}
