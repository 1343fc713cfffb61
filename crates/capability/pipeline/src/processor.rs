//! 单条消息的处理流程：解析规则 → 提取 → 替换/修复 → 组装 → 下发。

use crate::assemble::{AssemblyError, assemble};
use domain::topic::split_topic;
use domain::{
    Direction, MappingRule, PlatformNotification, RawEvent, RequestDescriptor, TOKEN_IDENTITY,
    TenantContext, path,
};
use mapper_cache::{IdentityService, InventoryService};
use mapper_dispatch::{RequestDispatcher, dispatch_with_retry};
use mapper_resolve::{MappingCacheManager, ResolveError};
use mapper_substitute::{
    ExtractionStrategy, Extractor, InstanceOutcome, SubstituteError, SubstitutionEngine,
    payload_document,
};
use mapper_telemetry::{
    record_assembly_error, record_budget_exceeded, record_dispatch_failure,
    record_extraction_error, record_identifier_error, record_mappings_resolved,
    record_message_unmapped, record_notification, record_processing_latency_ms, record_raw_event,
    record_request_dispatched, record_requests_emitted,
};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// 处理流程配置。
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub outbound_enabled: bool,
    /// 单条消息的处理时间预算；`None` 表示不限制。
    pub cpu_budget: Option<Duration>,
    pub log_payload: bool,
    pub dispatch_max_retries: u64,
    pub dispatch_backoff_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            outbound_enabled: true,
            cpu_budget: None,
            log_payload: false,
            dispatch_max_retries: 0,
            dispatch_backoff_ms: 0,
        }
    }
}

/// 处理错误。
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Substitute(#[from] SubstituteError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("processing budget exceeded after {elapsed_ms} ms")]
    BudgetExceeded { elapsed_ms: u64 },
    #[error("rule task failed: {0}")]
    Task(String),
}

/// 规则级或实例级失败；`instance_index` 为空表示整条规则被跳过。
#[derive(Debug)]
pub struct MappingFailure {
    pub mapping_id: String,
    pub instance_index: Option<usize>,
    pub error: ProcessingError,
}

/// 单条消息的处理结果。
#[derive(Debug, Default)]
pub struct ProcessingReport {
    /// 按规则解析顺序、实例序号排列。
    pub requests: Vec<RequestDescriptor>,
    pub failures: Vec<MappingFailure>,
    pub mappings_resolved: usize,
    /// 被 `filterInventory` 丢弃的实例数。
    pub filtered: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
}

impl ProcessingReport {
    pub fn is_unmapped(&self) -> bool {
        self.mappings_resolved == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Budget {
    started: Instant,
    limit: Option<Duration>,
}

impl Budget {
    fn exceeded(&self) -> Option<u64> {
        let limit = self.limit?;
        let elapsed = self.started.elapsed();
        (elapsed >= limit).then(|| elapsed.as_millis() as u64)
    }
}

/// 单条规则任务的输入。
struct RuleJob {
    ctx: TenantContext,
    rule: Arc<MappingRule>,
    extractor: ExtractionStrategy,
    identity: Arc<IdentityService>,
    inventory: Arc<InventoryService>,
    budget: Budget,
    log_payload: bool,
}

struct RuleOutcome {
    order: usize,
    requests: Vec<RequestDescriptor>,
    failures: Vec<MappingFailure>,
    filtered: usize,
}

impl RuleOutcome {
    fn new(order: usize) -> Self {
        Self {
            order,
            requests: Vec::new(),
            failures: Vec::new(),
            filtered: 0,
        }
    }

    fn fail(&mut self, mapping_id: &str, instance_index: Option<usize>, error: ProcessingError) {
        self.failures.push(MappingFailure {
            mapping_id: mapping_id.to_string(),
            instance_index,
            error,
        });
    }
}

/// 映射处理器：每条匹配规则一个任务并行处理，汇总后交给下发协作方。
#[derive(Clone)]
pub struct MappingProcessor {
    manager: Arc<MappingCacheManager>,
    extractor: ExtractionStrategy,
    inbound_dispatcher: Arc<dyn RequestDispatcher>,
    outbound_dispatcher: Arc<dyn RequestDispatcher>,
    config: ProcessorConfig,
}

impl MappingProcessor {
    pub fn new(manager: Arc<MappingCacheManager>, dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        Self {
            manager,
            extractor: ExtractionStrategy::default(),
            inbound_dispatcher: dispatcher.clone(),
            outbound_dispatcher: dispatcher,
            config: ProcessorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extractor(mut self, extractor: ExtractionStrategy) -> Self {
        self.extractor = extractor;
        self
    }

    /// 出站请求改用独立的下发器（例如 MQTT 发布）。
    pub fn with_outbound_dispatcher(mut self, dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        self.outbound_dispatcher = dispatcher;
        self
    }

    pub fn manager(&self) -> &Arc<MappingCacheManager> {
        &self.manager
    }

    /// 处理一条入站消息；租户未注册时返回错误，其余失败记录在报告中。
    pub async fn process_inbound(
        &self,
        ctx: &TenantContext,
        event: RawEvent,
    ) -> Result<ProcessingReport, ProcessingError> {
        record_raw_event();
        let budget = self.budget();
        let rules = self.manager.resolve_inbound(ctx, &event.topic)?;
        if rules.is_empty() {
            record_message_unmapped();
            debug!(
                target: "mapper.pipeline",
                tenant_id = %ctx.tenant_id,
                topic = %event.topic,
                "message_unmapped"
            );
            return Ok(ProcessingReport::default());
        }
        let tenant = self.manager.tenant(ctx)?;
        let payload = Arc::new(event.payload);
        let levels = Arc::new(split_topic(&event.topic));

        let mut tasks = JoinSet::new();
        for (order, rule) in rules.iter().enumerate() {
            let job = self.job(ctx, rule.clone(), &tenant.identity(), &tenant.inventory(), budget);
            let payload = payload.clone();
            let levels = levels.clone();
            tasks.spawn(async move { run_inbound_rule(order, job, payload, levels).await });
        }
        let mut report = collect(tasks, &rules).await;
        self.finish(ctx, &event.topic, budget, &mut report, self.inbound_dispatcher.as_ref())
            .await;
        Ok(report)
    }

    /// 处理一条平台通知；出站映射关闭时返回空报告。
    pub async fn process_outbound(
        &self,
        ctx: &TenantContext,
        notification: PlatformNotification,
    ) -> Result<ProcessingReport, ProcessingError> {
        if !self.config.outbound_enabled {
            debug!(
                target: "mapper.pipeline",
                tenant_id = %ctx.tenant_id,
                api = notification.api.as_str(),
                "outbound_disabled"
            );
            return Ok(ProcessingReport::default());
        }
        record_notification();
        let budget = self.budget();
        let rules = self
            .manager
            .resolve_outbound(ctx, notification.api, &notification.payload)?;
        let label = notification.api.as_str();
        if rules.is_empty() {
            record_message_unmapped();
            debug!(
                target: "mapper.pipeline",
                tenant_id = %ctx.tenant_id,
                api = label,
                source_id = %notification.source_id,
                "notification_unmapped"
            );
            return Ok(ProcessingReport::default());
        }
        let tenant = self.manager.tenant(ctx)?;
        let notification = Arc::new(notification);

        let mut tasks = JoinSet::new();
        for (order, rule) in rules.iter().enumerate() {
            let job = self.job(ctx, rule.clone(), &tenant.identity(), &tenant.inventory(), budget);
            let notification = notification.clone();
            tasks.spawn(async move { run_outbound_rule(order, job, notification).await });
        }
        let mut report = collect(tasks, &rules).await;
        self.finish(ctx, label, budget, &mut report, self.outbound_dispatcher.as_ref())
            .await;
        Ok(report)
    }

    fn budget(&self) -> Budget {
        Budget {
            started: Instant::now(),
            limit: self.config.cpu_budget,
        }
    }

    fn job(
        &self,
        ctx: &TenantContext,
        rule: Arc<MappingRule>,
        identity: &Arc<IdentityService>,
        inventory: &Arc<InventoryService>,
        budget: Budget,
    ) -> RuleJob {
        RuleJob {
            ctx: ctx.clone(),
            rule,
            extractor: self.extractor.clone(),
            identity: identity.clone(),
            inventory: inventory.clone(),
            budget,
            log_payload: self.config.log_payload,
        }
    }

    async fn finish(
        &self,
        ctx: &TenantContext,
        subject: &str,
        budget: Budget,
        report: &mut ProcessingReport,
        dispatcher: &dyn RequestDispatcher,
    ) {
        record_mappings_resolved(report.mappings_resolved as u64);
        record_requests_emitted(report.requests.len() as u64);
        if ctx.dry_run {
            info!(
                target: "mapper.pipeline",
                tenant_id = %ctx.tenant_id,
                subject,
                requests = report.requests.len(),
                "dispatch_skipped_dry_run"
            );
        } else {
            for request in &report.requests {
                match dispatch_with_retry(
                    dispatcher,
                    request,
                    self.config.dispatch_max_retries,
                    self.config.dispatch_backoff_ms,
                )
                .await
                {
                    Ok(()) => {
                        record_request_dispatched();
                        report.dispatched += 1;
                    }
                    Err(err) => {
                        record_dispatch_failure();
                        report.dispatch_failures += 1;
                        warn!(
                            target: "mapper.pipeline",
                            tenant_id = %ctx.tenant_id,
                            mapping_id = %request.mapping_id,
                            instance_index = request.instance_index,
                            error = %err,
                            "request_dispatch_failed"
                        );
                    }
                }
            }
        }
        record_processing_latency_ms(budget.started.elapsed().as_millis() as u64);
        info!(
            target: "mapper.pipeline",
            tenant_id = %ctx.tenant_id,
            subject,
            mappings = report.mappings_resolved,
            requests = report.requests.len(),
            failures = report.failures.len(),
            filtered = report.filtered,
            dispatched = report.dispatched,
            "message_processed"
        );
    }
}

/// 汇总各规则任务；任务 panic 时对应规则记为失败。
async fn collect(mut tasks: JoinSet<RuleOutcome>, rules: &[Arc<MappingRule>]) -> ProcessingReport {
    let mut outcomes = Vec::with_capacity(rules.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(target: "mapper.pipeline", error = %err, "rule_task_failed"),
        }
    }
    let finished: HashSet<usize> = outcomes.iter().map(|outcome| outcome.order).collect();
    for (order, rule) in rules.iter().enumerate() {
        if !finished.contains(&order) {
            let mut outcome = RuleOutcome::new(order);
            outcome.fail(
                &rule.id,
                None,
                ProcessingError::Task("rule task aborted".to_string()),
            );
            outcomes.push(outcome);
        }
    }
    outcomes.sort_by_key(|outcome| outcome.order);

    let mut report = ProcessingReport {
        mappings_resolved: rules.len(),
        ..ProcessingReport::default()
    };
    for outcome in outcomes {
        report.requests.extend(outcome.requests);
        report.failures.extend(outcome.failures);
        report.filtered += outcome.filtered;
    }
    report
}

async fn run_inbound_rule(
    order: usize,
    job: RuleJob,
    payload: Arc<Vec<u8>>,
    levels: Arc<Vec<String>>,
) -> RuleOutcome {
    let mut outcome = RuleOutcome::new(order);
    let rule = job.rule.clone();
    let document = match payload_document(&rule, &payload) {
        Ok(document) => document,
        Err(err) => {
            skip_rule(&job, &mut outcome, err);
            return outcome;
        }
    };
    let instances = match reconcile(&job, &document, &levels).await {
        Ok(instances) => instances,
        Err(err) => {
            skip_rule(&job, &mut outcome, err);
            return outcome;
        }
    };
    assemble_instances(&job, instances, &levels, &mut outcome).await;
    outcome
}

async fn run_outbound_rule(
    order: usize,
    job: RuleJob,
    notification: Arc<PlatformNotification>,
) -> RuleOutcome {
    let mut outcome = RuleOutcome::new(order);
    let rule = job.rule.clone();
    let external_id = match job
        .identity
        .resolve_external(&job.ctx, &notification.source_id, &rule.external_id_type)
        .await
    {
        Some(external_id) => external_id,
        None if job.ctx.dry_run => notification.source_id.clone(),
        None => {
            record_identifier_error();
            let error = SubstituteError::IdentifierResolution {
                external_id_type: rule.external_id_type.clone(),
                external_id: notification.source_id.clone(),
            };
            warn!(
                target: "mapper.pipeline",
                tenant_id = %job.ctx.tenant_id,
                mapping_id = %rule.id,
                error = %error,
                "outbound_identifier_unresolved"
            );
            outcome.fail(&rule.id, None, error.into());
            return outcome;
        }
    };

    let document = identity_document(&notification, &rule.external_id_type, &external_id);
    let levels = rule
        .publish_topic
        .as_deref()
        .map(split_topic)
        .unwrap_or_default();
    let instances = match reconcile(&job, &document, &levels).await {
        Ok(instances) => instances,
        Err(err) => {
            skip_rule(&job, &mut outcome, err);
            return outcome;
        }
    };
    assemble_instances(&job, instances, &levels, &mut outcome).await;
    for request in &mut outcome.requests {
        request.source_id = Some(notification.source_id.clone());
    }
    outcome
}

/// 把 `_IDENTITY_` 补进通知载荷，供提取阶段读取。
fn identity_document(
    notification: &PlatformNotification,
    external_id_type: &str,
    external_id: &str,
) -> Value {
    let mut identity = Map::new();
    identity.insert("externalId".to_string(), Value::from(external_id));
    identity.insert(
        "globalId".to_string(),
        Value::from(notification.source_id.as_str()),
    );
    identity.insert("externalIdType".to_string(), Value::from(external_id_type));

    let mut document = notification.payload.clone();
    match document.as_object_mut() {
        Some(object) => {
            object.insert(TOKEN_IDENTITY.to_string(), Value::Object(identity));
        }
        None => {
            let mut wrapped = Map::new();
            wrapped.insert("payload".to_string(), document);
            wrapped.insert(TOKEN_IDENTITY.to_string(), Value::Object(identity));
            document = Value::Object(wrapped);
        }
    }
    document
}

async fn reconcile(
    job: &RuleJob,
    document: &Value,
    levels: &[String],
) -> Result<Vec<InstanceOutcome>, SubstituteError> {
    let cache = job.extractor.extract(&job.ctx, &job.rule, document, levels)?;
    SubstitutionEngine::reconcile(&job.ctx, &job.rule, &cache, &job.identity).await
}

fn skip_rule(job: &RuleJob, outcome: &mut RuleOutcome, error: SubstituteError) {
    record_extraction_error();
    warn!(
        target: "mapper.pipeline",
        tenant_id = %job.ctx.tenant_id,
        mapping_id = %job.rule.id,
        error = %error,
        "mapping_skipped"
    );
    outcome.fail(&job.rule.id, None, error.into());
}

async fn assemble_instances(
    job: &RuleJob,
    instances: Vec<InstanceOutcome>,
    levels: &[String],
    outcome: &mut RuleOutcome,
) {
    let rule = &job.rule;
    for (index, instance) in instances.into_iter().enumerate() {
        if let Some(elapsed_ms) = job.budget.exceeded() {
            budget_exceeded(job, outcome, elapsed_ms);
            return;
        }
        let instance = match instance {
            Ok(instance) => instance,
            Err(err) => {
                record_identifier_error();
                warn!(
                    target: "mapper.pipeline",
                    tenant_id = %job.ctx.tenant_id,
                    mapping_id = %rule.id,
                    instance_index = index,
                    error = %err,
                    "instance_identifier_failed"
                );
                outcome.fail(&rule.id, Some(index), err.into());
                continue;
            }
        };
        if !passes_inventory_filter(job, instance.global_id.as_deref()).await {
            debug!(
                target: "mapper.pipeline",
                tenant_id = %job.ctx.tenant_id,
                mapping_id = %rule.id,
                instance_index = instance.index,
                source_id = ?instance.global_id,
                "instance_filtered"
            );
            outcome.filtered += 1;
            continue;
        }
        let request = match assemble(&job.ctx, rule, &instance, levels) {
            Ok(request) => request,
            Err(err) => {
                record_assembly_error();
                warn!(
                    target: "mapper.pipeline",
                    tenant_id = %job.ctx.tenant_id,
                    mapping_id = %rule.id,
                    instance_index = instance.index,
                    error = %err,
                    "instance_assembly_failed"
                );
                outcome.fail(&rule.id, Some(instance.index), err.into());
                continue;
            }
        };
        // 组装过程中超出预算：丢弃本实例
        if let Some(elapsed_ms) = job.budget.exceeded() {
            budget_exceeded(job, outcome, elapsed_ms);
            return;
        }
        if job.log_payload || rule.debug {
            info!(
                target: "mapper.pipeline",
                tenant_id = %job.ctx.tenant_id,
                mapping_id = %rule.id,
                instance_index = request.instance_index,
                api = request.api.as_str(),
                body = %request.body,
                "request_assembled"
            );
        }
        outcome.requests.push(request);
    }
}

fn budget_exceeded(job: &RuleJob, outcome: &mut RuleOutcome, elapsed_ms: u64) {
    record_budget_exceeded();
    warn!(
        target: "mapper.pipeline",
        tenant_id = %job.ctx.tenant_id,
        mapping_id = %job.rule.id,
        elapsed_ms,
        "processing_budget_exceeded"
    );
    outcome.fail(
        &job.rule.id,
        None,
        ProcessingError::BudgetExceeded { elapsed_ms },
    );
}

/// 入站规则的 `filterInventory`：设备属性中必须存在该路径。
async fn passes_inventory_filter(job: &RuleJob, global_id: Option<&str>) -> bool {
    let Some(filter) = job.rule.filter_inventory.as_deref() else {
        return true;
    };
    if job.rule.direction != Direction::Inbound {
        return true;
    }
    let Some(global_id) = global_id else {
        return false;
    };
    match job.inventory.attributes(&job.ctx, global_id).await {
        Some(attributes) => path::exists(&Value::Object(attributes.as_ref().clone()), filter),
        None => false,
    }
}
