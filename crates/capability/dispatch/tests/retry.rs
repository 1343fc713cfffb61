use async_trait::async_trait;
use domain::{Direction, RequestDescriptor, TargetApi};
use mapper_dispatch::{
    ChannelDispatcher, DispatchError, RequestDispatcher, dispatch_with_retry,
};
use std::sync::atomic::{AtomicUsize, Ordering};

struct FlakyDispatcher {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyDispatcher {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RequestDispatcher for FlakyDispatcher {
    async fn dispatch(&self, _request: &RequestDescriptor) -> Result<(), DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(DispatchError::Dispatch("broker unavailable".to_string()));
        }
        Ok(())
    }
}

fn request() -> RequestDescriptor {
    RequestDescriptor {
        tenant_id: "t1".to_string(),
        mapping_id: "m1".to_string(),
        direction: Direction::Inbound,
        api: TargetApi::Measurement,
        source_id: Some("101".to_string()),
        external_id: Some("dev-1".to_string()),
        body: serde_json::json!({ "source": { "id": "101" } }).to_string(),
        publish_topic: None,
        instance_index: 0,
    }
}

#[tokio::test]
async fn retry_succeeds_within_budget() {
    let dispatcher = FlakyDispatcher::new(2);
    dispatch_with_retry(&dispatcher, &request(), 2, 0)
        .await
        .expect("dispatched");
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_gives_up_after_max_retries() {
    let dispatcher = FlakyDispatcher::new(5);
    let err = dispatch_with_retry(&dispatcher, &request(), 1, 0)
        .await
        .expect_err("exhausted");
    assert!(matches!(err, DispatchError::Dispatch(_)));
    assert_eq!(dispatcher.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn channel_dispatcher_forwards_requests() {
    let (dispatcher, mut receiver) = ChannelDispatcher::channel(4);
    dispatcher.dispatch(&request()).await.expect("sent");
    let received = receiver.recv().await.expect("received");
    assert_eq!(received, request());

    drop(receiver);
    let err = dispatcher.dispatch(&request()).await.expect_err("closed");
    assert!(matches!(err, DispatchError::Closed));
}
