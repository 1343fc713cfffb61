//! 接入链路装配
//!
//! 把 MQTT 接入源与映射处理器连接起来：普通 topic 按入站方向处理，
//! 平台通知 topic 上的消息解析为 [`PlatformNotification`] 后按出站方向处理。

use domain::{PlatformNotification, RawEvent, TargetApi, TenantContext, topic};
use mapper_config::ServiceConfig;
use mapper_ingest::{IngestError, MqttSource, MqttSourceConfig, NoopSource, RawEventHandler, Source};
use mapper_pipeline::{MappingProcessor, ProcessingReport};
use mapper_resolve::ResolveError;
use mapper_telemetry::new_request_ids;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};

/// 平台通知报文。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationEnvelope {
    api: TargetApi,
    source_id: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// 映射处理器的 RawEvent 适配。
struct MappingHandler {
    ctx: TenantContext,
    processor: MappingProcessor,
    notification_topic: Option<String>,
}

impl MappingHandler {
    fn is_notification(&self, event: &RawEvent) -> bool {
        self.notification_topic
            .as_deref()
            .is_some_and(|pattern| topic::matches(pattern, &event.topic))
    }

    async fn handle_notification(&self, event: RawEvent) -> Result<ProcessingReport, IngestError> {
        let envelope: NotificationEnvelope = serde_json::from_slice(&event.payload)
            .map_err(|err| IngestError::Handler(format!("invalid notification: {err}")))?;
        let notification = PlatformNotification {
            tenant_id: event.tenant_id,
            api: envelope.api,
            source_id: envelope.source_id,
            payload: envelope.payload,
            received_at_ms: event.received_at_ms,
        };
        self.processor
            .process_outbound(&self.ctx, notification)
            .await
            .map_err(|err| IngestError::Handler(err.to_string()))
    }
}

#[async_trait::async_trait]
impl RawEventHandler for MappingHandler {
    async fn handle(&self, event: RawEvent) -> Result<(), IngestError> {
        let ids = new_request_ids();
        let span = info_span!(
            "raw_event",
            request_id = %ids.request_id,
            trace_id = %ids.trace_id,
            topic = %event.topic
        );
        async move {
            info!(
                target: "mapper.ingest",
                tenant_id = %event.tenant_id,
                connector_id = %event.connector_id,
                payload_size = event.payload.len(),
                received_at_ms = event.received_at_ms,
                "raw_event_received"
            );
            let report = if self.is_notification(&event) {
                self.handle_notification(event).await?
            } else {
                self.processor
                    .process_inbound(&self.ctx, event)
                    .await
                    .map_err(|err| IngestError::Handler(err.to_string()))?
            };
            if !report.failures.is_empty() {
                warn!(
                    target: "mapper.ingest",
                    failures = report.failures.len(),
                    requests = report.requests.len(),
                    "raw_event_partially_mapped"
                );
            }
            Ok::<(), IngestError>(())
        }
        .instrument(span)
        .await
    }
}

/// 启动接入任务
///
/// 订阅租户启用中入站规则的订阅 topic，以及（启用出站时）平台通知 topic。
pub fn spawn_ingest(
    config: &ServiceConfig,
    ctx: TenantContext,
    processor: MappingProcessor,
) -> Result<tokio::task::JoinHandle<()>, ResolveError> {
    let notification_topic = config
        .notification_topic
        .clone()
        .filter(|_| config.outbound_enabled);
    let mut topics = processor.manager().inbound_subscriptions(&ctx)?;
    if let Some(pattern) = &notification_topic {
        topics.push(pattern.clone());
    }

    let source: Arc<dyn Source> = if config.ingest_enabled && !topics.is_empty() {
        let mqtt_config = MqttSourceConfig {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            tenant_id: ctx.tenant_id.clone(),
            connector_id: config.connector_id.clone(),
            topics,
            qos: config.mqtt_publish_qos,
            max_in_flight: config.ingest_max_in_flight,
        };
        info!(
            target: "mapper.ingest",
            host = %mqtt_config.host,
            port = mqtt_config.port,
            topics = ?mqtt_config.topics,
            "ingest_source_mqtt"
        );
        Arc::new(MqttSource::new(mqtt_config))
    } else {
        info!(target: "mapper.ingest", "ingest_source_noop");
        Arc::new(NoopSource)
    };

    let handler = Arc::new(MappingHandler {
        ctx,
        processor,
        notification_topic,
    });
    Ok(tokio::spawn(async move {
        if let Err(err) = source.run(handler).await {
            warn!(target: "mapper.ingest", error = %err, "ingest_stopped");
        }
    }))
}
