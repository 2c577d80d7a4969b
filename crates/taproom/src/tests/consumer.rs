//! Consumer scenarios: what gets acked, rejected or left, and reconnecting.

use super::harness::{eventually, request, request_queue, TestHarness};
use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, Delivery};
use crate::consumer::{ConsumerConfig, Disposition, RequestConsumer, RequestProcessor};
use crate::error::{TaproomError, TaproomResult};
use crate::protocol::InvocationMessage;
use crate::request::{Request, Target};
use crate::status::RequestStatus;
use crate::store::RequestStore;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn delivery(request: &Request) -> Delivery {
    Delivery {
        id: "1-0".to_string(),
        queue_key: request_queue(),
        payload: InvocationMessage::new(request.clone()).encode().unwrap(),
    }
}

#[tokio::test]
async fn accepted_request_is_acked_and_runs() {
    let harness = TestHarness::without_routing();
    let consumer = harness.consumer(harness.dispatcher(2, 4));

    let submitted = harness
        .store
        .submit_request(&request("echo", json!({"msg": "hello"})))
        .await
        .unwrap();
    harness.publish(&submitted).await;

    let done = harness.wait_terminal(submitted.id.as_deref().unwrap()).await;
    assert_eq!(done.status, RequestStatus::Success);
    assert_eq!(done.output, Some(json!("hello")));
    assert_eq!(harness.broker.acked().len(), 1);
    assert_eq!(harness.broker.pending_count(), 0);

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn undecodable_message_is_rejected() {
    let harness = TestHarness::without_routing();
    let consumer = harness.consumer(harness.dispatcher(1, 4));

    harness.publish_raw(b"{not json").await;
    // A stream entry without a payload field arrives empty.
    harness.publish_raw(b"").await;

    // Well-formed JSON, but the request has no id.
    let anonymous = Request::new(
        &Target::new("echo", "1.0.0", "default", "default"),
        "echo",
        Default::default(),
    );
    let payload = serde_json::to_vec(&json!({ "request": anonymous })).unwrap();
    harness.publish_raw(&payload).await;

    assert!(eventually(|| harness.broker.rejected().len() == 3).await);
    assert!(harness.broker.acked().is_empty());
    assert_eq!(harness.broker.pending_count(), 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn request_for_another_worker_is_rejected() {
    let harness = TestHarness::without_routing();
    let consumer = harness.consumer(harness.dispatcher(1, 4));

    let mut stray = Request::new(
        &Target::new("echo", "2.0.0", "default", "default"),
        "echo",
        Default::default(),
    );
    stray.ensure_id();
    harness.publish(&stray).await;

    assert!(eventually(|| harness.broker.rejected().len() == 1).await);
    let rejected = harness.broker.rejected();
    assert!(rejected[0].reason.contains("addressed to"), "{}", rejected[0].reason);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn terminal_message_is_republished_and_acked() {
    let harness = TestHarness::without_routing();
    let consumer = harness.consumer(harness.dispatcher(1, 4));

    // The store is behind: it still has the request as CREATED.
    let submitted = harness
        .store
        .submit_request(&request("slow", json!({"ms": 10})))
        .await
        .unwrap();
    let mut finished = submitted.clone();
    finished.succeed(json!("done elsewhere"));
    harness.publish(&finished).await;

    let stored = harness.wait_terminal(submitted.id.as_deref().unwrap()).await;
    assert_eq!(stored.status, RequestStatus::Success);
    assert_eq!(stored.output, Some(json!("done elsewhere")));

    // The store is already terminal: the update is refused, the message
    // is still acked.
    let mut late = finished.clone();
    late.fail(RequestStatus::Error, "too late", "LateError");
    harness.publish(&late).await;

    assert!(eventually(|| harness.broker.acked().len() == 2).await);
    assert_eq!(
        harness.stored(submitted.id.as_deref().unwrap()).unwrap().status,
        RequestStatus::Success
    );
    assert_eq!(harness.gauge.started(), 0);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn message_is_left_pending_during_shutdown() {
    let harness = TestHarness::without_routing();
    let dispatcher = harness.dispatcher(1, 4);
    let processor = RequestProcessor::new(dispatcher.clone(), harness.publisher());
    dispatcher.shutdown().await;

    let disposition = processor
        .process(&delivery(&request("echo", json!({"msg": "late"}))))
        .await;
    assert_eq!(disposition, Disposition::Leave);
}

#[tokio::test]
async fn recovers_after_transient_read_failures() {
    let harness = TestHarness::without_routing();
    harness.broker.fail_next_reads(2);
    let consumer = harness.consumer(harness.dispatcher(1, 4));

    let submitted = harness
        .store
        .submit_request(&request("echo", json!({"msg": "after outage"})))
        .await
        .unwrap();
    harness.publish(&submitted).await;

    let done = harness.wait_terminal(submitted.id.as_deref().unwrap()).await;
    assert_eq!(done.status, RequestStatus::Success);
    assert_eq!(harness.broker.reconnect_count(), 2);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn gives_up_after_bounded_reconnects() {
    let harness = TestHarness::without_routing();
    harness.broker.fail_next_reads(1);
    harness.broker.fail_next_reconnects(100);
    let mut consumer = harness.consumer(harness.dispatcher(1, 4));

    let result = tokio::time::timeout(Duration::from_secs(2), consumer.finished())
        .await
        .expect("consumer should stop on its own");
    match result {
        Err(TaproomError::RetriesExhausted {
            operation,
            attempts,
            ..
        }) => {
            assert_eq!(operation, "reconnect");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhausted reconnects, got {other:?}"),
    }
    assert_eq!(harness.broker.reconnect_count(), 0);
}

#[tokio::test]
async fn stop_is_prompt_while_reading() {
    let harness = TestHarness::without_routing();
    let consumer = harness.consumer(harness.dispatcher(1, 4));
    tokio::time::sleep(Duration::from_millis(30)).await;

    tokio::time::timeout(Duration::from_secs(1), consumer.stop())
        .await
        .expect("stop should not hang")
        .unwrap();
}

/// Broker whose every read comes back malformed.
struct GarbledBroker {
    reads: Arc<AtomicU32>,
}

#[async_trait]
impl Broker for GarbledBroker {
    async fn publish(&mut self, _: &str, _: &[u8]) -> TaproomResult<String> {
        Ok("1-0".to_string())
    }

    async fn read_next(&mut self, _: &str, _: Duration) -> TaproomResult<Option<Delivery>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(TaproomError::Decode("garbled stream entry".into()))
    }

    async fn ack(&mut self, _: &Delivery) -> TaproomResult<()> {
        Ok(())
    }

    async fn reject(&mut self, _: &Delivery, _: &str) -> TaproomResult<()> {
        Ok(())
    }

    async fn reconnect(&mut self) -> TaproomResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn unusable_reads_back_off() {
    let harness = TestHarness::without_routing();
    let reads = Arc::new(AtomicU32::new(0));
    let broker = GarbledBroker {
        reads: reads.clone(),
    };
    let config = ConsumerConfig {
        queue_key: request_queue(),
        block: Duration::from_millis(20),
        reconnect: BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(40), 3),
    };
    let consumer = RequestConsumer::new(
        broker,
        config,
        RequestProcessor::new(harness.dispatcher(1, 4), harness.publisher()),
    )
    .start();

    tokio::time::sleep(Duration::from_millis(150)).await;
    consumer.stop().await.unwrap();

    let reads = reads.load(Ordering::SeqCst);
    assert!((2..=10).contains(&reads), "read {reads} times");
}
