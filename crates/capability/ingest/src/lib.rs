use async_trait::async_trait;
use domain::RawEvent;
use mapper_dispatch::qos_from_u8;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// 单个接入源默认的并发处理上限。
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

/// 接入错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("handler error: {0}")]
    Handler(String),
    #[error("source error: {0}")]
    Source(String),
}

/// RawEvent 处理器。
#[async_trait]
pub trait RawEventHandler: Send + Sync {
    async fn handle(&self, event: RawEvent) -> Result<(), IngestError>;
}

/// 接入源抽象。
#[async_trait]
pub trait Source: Send + Sync {
    async fn run(&self, handler: Arc<dyn RawEventHandler>) -> Result<(), IngestError>;
}

/// 占位源（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopSource;

#[async_trait]
impl Source for NoopSource {
    async fn run(&self, _handler: Arc<dyn RawEventHandler>) -> Result<(), IngestError> {
        Ok(())
    }
}

/// 有界并发的事件处理调度。
///
/// 每条事件在独立任务中处理；在途任务达到上限时 [`HandlerPool::submit`] 等待空闲名额。
pub struct HandlerPool {
    handler: Arc<dyn RawEventHandler>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    tasks: JoinSet<()>,
}

impl HandlerPool {
    pub fn new(handler: Arc<dyn RawEventHandler>, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            handler,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            tasks: JoinSet::new(),
        }
    }

    pub async fn submit(&mut self, event: RawEvent) -> Result<(), IngestError> {
        while self.tasks.try_join_next().is_some() {}
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::Source("handler pool closed".to_string()))?;
        let handler = self.handler.clone();
        self.tasks.spawn(async move {
            let topic = event.topic.clone();
            if let Err(err) = handler.handle(event).await {
                warn!(
                    target: "mapper.ingest",
                    topic = %topic,
                    error = %err,
                    "raw_event_handler_failed"
                );
            }
            drop(permit);
        });
        Ok(())
    }

    /// 当前在途的处理任务数。
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// 等待全部在途任务结束。
    pub async fn drain(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

/// MQTT 接入源配置。
#[derive(Debug, Clone)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tenant_id: String,
    pub connector_id: String,
    /// 订阅模式（通常为租户启用中的入站规则的订阅 topic）。
    pub topics: Vec<String>,
    pub qos: u8,
    /// 并发处理上限。
    pub max_in_flight: usize,
}

/// MQTT 接入源：订阅给定模式，把每条 publish 转为 [`RawEvent`]。
#[derive(Debug, Clone)]
pub struct MqttSource {
    config: MqttSourceConfig,
}

impl MqttSource {
    pub fn new(config: MqttSourceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MqttSourceConfig {
        &self.config
    }

    fn raw_event(&self, topic: &str, payload: &[u8]) -> RawEvent {
        RawEvent {
            tenant_id: self.config.tenant_id.clone(),
            connector_id: self.config.connector_id.clone(),
            topic: topic.to_string(),
            payload: payload.to_vec(),
            received_at_ms: now_epoch_ms(),
        }
    }
}

#[async_trait]
impl Source for MqttSource {
    async fn run(&self, handler: Arc<dyn RawEventHandler>) -> Result<(), IngestError> {
        let client_id = format!("mapper-ingest-{}", uuid::Uuid::new_v4());
        let mut options =
            rumqttc::MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) =
            (self.config.username.as_ref(), self.config.password.as_ref())
        {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 10);
        let qos = qos_from_u8(self.config.qos);
        for topic in &self.config.topics {
            client
                .subscribe(topic.clone(), qos)
                .await
                .map_err(|err| IngestError::Source(err.to_string()))?;
        }
        info!(
            target: "mapper.ingest",
            tenant_id = %self.config.tenant_id,
            connector_id = %self.config.connector_id,
            topics = self.config.topics.len(),
            "mqtt_source_subscribed"
        );

        let mut pool = HandlerPool::new(handler, self.config.max_in_flight);
        loop {
            match eventloop.poll().await {
                Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                    let event = self.raw_event(&publish.topic, &publish.payload);
                    pool.submit(event).await?;
                }
                Ok(_) => {}
                Err(err) => {
                    pool.drain().await;
                    return Err(IngestError::Source(err.to_string()));
                }
            }
        }
    }
}

pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source() -> MqttSource {
        MqttSource::new(MqttSourceConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: None,
            password: None,
            tenant_id: "t1".to_string(),
            connector_id: "mqtt-1".to_string(),
            topics: vec!["device/+/temp".to_string()],
            qos: 1,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        })
    }

    #[test]
    fn publish_becomes_raw_event() {
        let event = source().raw_event("device/d1/temp", br#"{"t":1}"#);
        assert_eq!(event.tenant_id, "t1");
        assert_eq!(event.connector_id, "mqtt-1");
        assert_eq!(event.topic, "device/d1/temp");
        assert_eq!(event.payload, br#"{"t":1}"#.to_vec());
        assert!(event.received_at_ms > 0);
    }

    #[tokio::test]
    async fn noop_source_returns_immediately() {
        struct Reject;

        #[async_trait]
        impl RawEventHandler for Reject {
            async fn handle(&self, _event: RawEvent) -> Result<(), IngestError> {
                Err(IngestError::Handler("unexpected".to_string()))
            }
        }

        NoopSource.run(Arc::new(Reject)).await.expect("noop");
    }

    struct Gated {
        gate: Arc<Semaphore>,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl RawEventHandler for Gated {
        async fn handle(&self, _event: RawEvent) -> Result<(), IngestError> {
            let _open = self
                .gate
                .acquire()
                .await
                .map_err(|err| IngestError::Handler(err.to_string()))?;
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_runs_handlers_concurrently_up_to_limit() {
        let handler = Arc::new(Gated {
            gate: Arc::new(Semaphore::new(0)),
            handled: AtomicUsize::new(0),
        });
        let event = || source().raw_event("device/d1/temp", b"{}");
        let mut pool = HandlerPool::new(handler.clone(), 2);

        pool.submit(event()).await.expect("first");
        pool.submit(event()).await.expect("second");
        assert_eq!(pool.in_flight(), 2);

        // 两个处理都被阻塞，第三条等待空闲名额
        let third = tokio::time::timeout(Duration::from_millis(50), pool.submit(event())).await;
        assert!(third.is_err());

        handler.gate.add_permits(3);
        pool.submit(event()).await.expect("third");
        pool.drain().await;
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
    }
}
