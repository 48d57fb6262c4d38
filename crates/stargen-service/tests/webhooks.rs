//! Provider callback integration tests.

mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use common::TestHarness;
use serde_json::json;

use stargen_core::{GenerationId, GenerationStatus, PriceOptions, TransactionType};
use stargen_service::GenerationRequest;

const SECRET: &str = "callback-secret";

/// Submit a KIE job and stop its monitor, as a restart would.
async fn orphaned_job(harness: &TestHarness) -> (GenerationId, String) {
    harness.fund(1_000).await;
    let submission = harness
        .state
        .orchestrator
        .submit(GenerationRequest {
            user_id: harness.test_user_id,
            model_id: "kling".into(),
            prompt: "a lantern drifting downstream".into(),
            options: PriceOptions {
                model_variant: Some("kling-2.6".into()),
                duration_seconds: Some(5),
                audio: Some(false),
                ..PriceOptions::default()
            },
            aspect_ratio: None,
            reference_images: Vec::new(),
            mode: None,
        })
        .await
        .expect("submission accepted");
    harness.state.poller.shutdown().await;

    let record = harness
        .state
        .repository
        .get(&submission.generation_id)
        .await
        .unwrap()
        .unwrap();
    (submission.generation_id, record.job.unwrap().task_id)
}

fn success(task_id: &str) -> serde_json::Value {
    json!({
        "code": 200,
        "msg": "success",
        "data": {
            "taskId": task_id,
            "state": "success",
            "resultJson": "{\"resultUrls\":[\"https://cdn.test/lantern.mp4\"]}"
        }
    })
}

fn failure(task_id: &str) -> serde_json::Value {
    json!({
        "code": 200,
        "msg": "success",
        "data": {
            "taskId": task_id,
            "state": "fail",
            "failMsg": "content policy violation"
        }
    })
}

fn bearer(secret: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {secret}")).unwrap(),
    )
}

async fn refunds(harness: &TestHarness, id: &GenerationId) -> usize {
    harness
        .store
        .transactions_for(id)
        .await
        .iter()
        .filter(|t| t.transaction_type == TransactionType::Refund)
        .count()
}

#[tokio::test]
async fn success_callback_completes_job() {
    let harness = TestHarness::with_callback_secret(SECRET);
    let (id, task_id) = orphaned_job(&harness).await;
    let (name, value) = bearer(SECRET);

    let response = harness
        .server
        .post("/v1/webhooks/kie")
        .add_header(name, value)
        .json(&success(&task_id))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["task_id"], task_id);
    assert_eq!(body["generation_id"], id.to_string());
    assert_eq!(body["status"], "completed");

    let record = harness.state.repository.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), GenerationStatus::Completed);
    assert_eq!(record.outputs[0].url, "https://cdn.test/lantern.mp4");
    assert_eq!(refunds(&harness, &id).await, 0);
}

#[tokio::test]
async fn repeated_failure_callback_refunds_once() {
    let harness = TestHarness::with_callback_secret(SECRET);
    let (id, task_id) = orphaned_job(&harness).await;

    for _ in 0..2 {
        let response = harness
            .server
            .post(&format!("/v1/webhooks/kie?secret={SECRET}"))
            .json(&failure(&task_id))
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "failed");
    }

    let record = harness.state.repository.get(&id).await.unwrap().unwrap();
    assert_eq!(record.error_code.as_deref(), Some("provider_failure"));
    assert_eq!(refunds(&harness, &id).await, 1);
    assert_eq!(harness.balance().await, 1_000);
}

#[tokio::test]
async fn callback_after_completion_is_acknowledged() {
    let harness = TestHarness::new();
    let (id, task_id) = orphaned_job(&harness).await;

    harness
        .server
        .post("/v1/webhooks/kie")
        .json(&success(&task_id))
        .await
        .assert_status_ok();
    let response = harness
        .server
        .post("/v1/webhooks/kie")
        .json(&failure(&task_id))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "completed");
    assert_eq!(refunds(&harness, &id).await, 0);
}

#[tokio::test]
async fn wrong_secret_is_unauthorized() {
    let harness = TestHarness::with_callback_secret(SECRET);
    let (id, task_id) = orphaned_job(&harness).await;
    let (name, value) = bearer("guess");

    harness
        .server
        .post("/v1/webhooks/kie")
        .add_header(name, value)
        .json(&success(&task_id))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    harness
        .server
        .post("/v1/webhooks/kie")
        .json(&success(&task_id))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let record = harness.state.repository.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status(), GenerationStatus::Generating);
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let harness = TestHarness::new();

    harness
        .server
        .post("/v1/webhooks/kie")
        .json(&success("never-submitted"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn payload_without_task_is_bad_request() {
    let harness = TestHarness::new();

    harness
        .server
        .post("/v1/webhooks/kie")
        .json(&json!({ "code": 200, "msg": "success" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}
