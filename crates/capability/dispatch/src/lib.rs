//! 请求下发：把组装好的 [`RequestDescriptor`] 交给平台侧或 MQTT broker。

use async_trait::async_trait;
use domain::{Direction, RequestDescriptor};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 下发错误。
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("missing publish topic for mapping {0}")]
    MissingTopic(String),
    #[error("dispatch channel closed")]
    Closed,
}

/// 请求下发器抽象。
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(&self, request: &RequestDescriptor) -> Result<(), DispatchError>;
}

/// 空下发器（用于占位）。
#[derive(Debug, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl RequestDispatcher for NoopDispatcher {
    async fn dispatch(&self, _request: &RequestDescriptor) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// 只记录日志的下发器，平台 API 未接入时使用。
#[derive(Debug, Default)]
pub struct LogDispatcher {
    log_payload: bool,
}

impl LogDispatcher {
    pub fn new(log_payload: bool) -> Self {
        Self { log_payload }
    }
}

#[async_trait]
impl RequestDispatcher for LogDispatcher {
    async fn dispatch(&self, request: &RequestDescriptor) -> Result<(), DispatchError> {
        info!(
            target: "mapper.dispatch",
            tenant_id = %request.tenant_id,
            mapping_id = %request.mapping_id,
            api = request.api.as_str(),
            source_id = ?request.source_id,
            external_id = ?request.external_id,
            publish_topic = ?request.publish_topic,
            instance_index = request.instance_index,
            body_size = request.body.len(),
            "request_logged"
        );
        if self.log_payload {
            info!(target: "mapper.dispatch", body = %request.body, "request_payload");
        }
        Ok(())
    }
}

/// 通过 mpsc 通道转交请求，供嵌入方自行消费。
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<RequestDescriptor>,
}

impl ChannelDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RequestDescriptor>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl RequestDispatcher for ChannelDispatcher {
    async fn dispatch(&self, request: &RequestDescriptor) -> Result<(), DispatchError> {
        self.sender
            .send(request.clone())
            .await
            .map_err(|_| DispatchError::Closed)
    }
}

/// MQTT 发布器配置。
#[derive(Debug, Clone)]
pub struct MqttPublisherConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
}

/// MQTT 发布器：把出站请求体发布到其 publish topic。
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
}

impl MqttPublisher {
    pub fn connect(
        config: MqttPublisherConfig,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), DispatchError> {
        let client_id = format!("mapper-publish-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    warn!(target: "mapper.dispatch", "mqtt publish eventloop error: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });
        Ok((
            Self {
                client,
                qos: qos_from_u8(config.qos),
            },
            handle,
        ))
    }
}

#[async_trait]
impl RequestDispatcher for MqttPublisher {
    async fn dispatch(&self, request: &RequestDescriptor) -> Result<(), DispatchError> {
        let topic = publish_topic_for(request)?;
        info!(
            target: "mapper.dispatch",
            tenant_id = %request.tenant_id,
            mapping_id = %request.mapping_id,
            topic = %topic,
            payload_size = request.body.len(),
            "request_publish"
        );
        self.client
            .publish(topic, self.qos, false, request.body.clone().into_bytes())
            .await
            .map_err(|err| DispatchError::Dispatch(err.to_string()))
    }
}

fn publish_topic_for(request: &RequestDescriptor) -> Result<String, DispatchError> {
    match (&request.direction, &request.publish_topic) {
        (Direction::Outbound, Some(topic)) if !topic.is_empty() => Ok(topic.clone()),
        _ => Err(DispatchError::MissingTopic(request.mapping_id.clone())),
    }
}

/// 失败后按固定退避重试，最多额外尝试 `max_retries` 次。
pub async fn dispatch_with_retry(
    dispatcher: &dyn RequestDispatcher,
    request: &RequestDescriptor,
    max_retries: u64,
    backoff_ms: u64,
) -> Result<(), DispatchError> {
    let mut attempt = 0u64;
    loop {
        match dispatcher.dispatch(request).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(err);
                }
                warn!(
                    target: "mapper.dispatch",
                    mapping_id = %request.mapping_id,
                    attempt,
                    error = %err,
                    "request_dispatch_retry"
                );
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }
}

pub fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}
