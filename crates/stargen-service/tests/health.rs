//! Health endpoint tests.

mod common;

use common::TestHarness;

#[tokio::test]
async fn health_is_public() {
    let harness = TestHarness::new();

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "stargen");
}

#[tokio::test]
async fn health_names_catalog_and_store() {
    let harness = TestHarness::new();

    let body: serde_json::Value = harness.server.get("/health").await.json();

    assert_eq!(body["catalog_version"], harness.state.catalog.version());
    assert_eq!(body["store"], "memory");
    assert_eq!(body["active_monitors"], 0);
}
