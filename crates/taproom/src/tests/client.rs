//! RPC client scenarios against a running worker.

use super::harness::{eventually, params_of, TestHarness, NAMESPACE};
use crate::client::InvokeOptions;
use crate::error::TaproomError;
use crate::request::Parameters;
use crate::status::RequestStatus;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn self_reference_does_not_deadlock_single_slot_pool() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(1);

    let parent = tokio::time::timeout(
        Duration::from_secs(5),
        harness.client.invoke(
            "call_self",
            params_of(json!({"msg": "hi"})),
            InvokeOptions::default(),
        ),
    )
    .await
    .expect("self-reference deadlocked")
    .unwrap();

    assert_eq!(parent.status, RequestStatus::Success);
    let parent_id = parent.id.clone().unwrap();
    let output = parent.output.unwrap();
    assert_eq!(output["status"], json!("SUCCESS"));
    assert_eq!(output["output"], json!("hi"));
    assert_eq!(output["parent"], json!(parent_id));

    // The inline child is uploaded in the background.
    let child_id = output["id"].as_str().unwrap().to_string();
    assert!(eventually(|| harness.stored(&child_id).is_some()).await);
    let children = harness.client.children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, RequestStatus::Success);
    assert_eq!(children[0].system_version, "1.0.0");

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn non_blocking_self_reference_still_runs_inline() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(1);

    let parent = harness
        .client
        .invoke("call_self_nonblocking", Parameters::new(), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(parent.output, Some(json!("SUCCESS")));

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn detached_self_reference_runs_inline_without_parent() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(1);

    let parent = harness
        .client
        .invoke("call_self_detached", Parameters::new(), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(parent.status, RequestStatus::Success, "{:?}", parent.error);

    let output = parent.output.unwrap();
    assert_eq!(output["status"], json!("SUCCESS"));
    assert_eq!(output["output"], json!("alone"));
    assert_eq!(output["parent"], json!(null));

    let child_id = output["id"].as_str().unwrap().to_string();
    assert!(eventually(|| harness.stored(&child_id).is_some()).await);
    assert_eq!(harness.stored(&child_id).unwrap().parent, None);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn parent_defaults_to_current_invocation() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(2);

    let parent = harness
        .client
        .invoke("call_other", Parameters::new(), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(parent.status, RequestStatus::Success);

    let child_id = parent.output.unwrap().as_str().unwrap().to_string();
    let child = harness.stored(&child_id).unwrap();
    assert_eq!(child.parent, parent.id);
    assert_eq!(child.system, "other");
    assert_eq!(child.namespace, NAMESPACE);
    assert_eq!(child.status, RequestStatus::Created);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn detached_call_has_no_parent() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(2);

    let parent = harness
        .client
        .invoke("call_other_detached", Parameters::new(), InvokeOptions::default())
        .await
        .unwrap();
    let child_id = parent.output.unwrap().as_str().unwrap().to_string();
    assert_eq!(harness.stored(&child_id).unwrap().parent, None);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn finished_parent_cannot_gain_children() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(2);

    let parent = harness
        .client
        .invoke("leak_context", Parameters::new(), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(parent.status, RequestStatus::Success);

    let context = harness.leaked.lock().clone().unwrap();
    assert_eq!(context.status(), RequestStatus::Success);

    let stored_before = harness.store.len();
    let err = harness
        .client
        .invoke(
            "echo",
            params_of(json!({"msg": "orphan"})),
            InvokeOptions::default().with_context(context),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaproomError::ParentCompleted { .. }), "{err}");
    assert_eq!(harness.store.len(), stored_before);

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn error_status_raises_only_when_asked() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(2);

    let failed = harness
        .client
        .invoke("fail", Parameters::new(), InvokeOptions::default())
        .await
        .unwrap();
    assert_eq!(failed.status, RequestStatus::Error);
    assert_eq!(failed.error_class.as_deref(), Some("ValueError"));

    let err = harness
        .client
        .invoke(
            "fail",
            Parameters::new(),
            InvokeOptions::default().raise_on_error(true),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaproomError::RequestFailed { ref message, .. } if message == "boom"));

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn non_blocking_call_can_be_awaited_later() {
    let harness = TestHarness::new();
    let worker = harness.start_worker(2);

    let submitted = harness
        .client
        .invoke(
            "slow",
            params_of(json!({"ms": 50})),
            InvokeOptions::default().blocking(false),
        )
        .await
        .unwrap();
    assert!(!submitted.is_terminal());

    let done = harness
        .client
        .wait_for(submitted.id.as_deref().unwrap(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(done.status, RequestStatus::Success);
    assert_eq!(done.output, Some(json!(50)));

    worker.stop().await.unwrap();
}
