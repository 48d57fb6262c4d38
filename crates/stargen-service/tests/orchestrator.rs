//! End-to-end charge and refund accounting, driven through the orchestrator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::test_config;
use chrono::Utc;
use serde_json::json;
use stargen_core::{
    columns, ColumnMap, GenerationError, GenerationId, GenerationMode, GenerationRecord,
    GenerationStatus, ModelCatalog, OutputRef, PriceOptions, ProviderKind, TransactionType, UserId,
};
use stargen_providers::{DispatchOutcome, PollResult, ProviderRegistry, ScriptedProvider};
use stargen_service::{AppState, GenerationRequest, PollerConfig};
use stargen_store::MemoryStore;

struct Fixture {
    state: AppState,
    store: Arc<MemoryStore>,
    kie: Arc<ScriptedProvider>,
    openai: Arc<ScriptedProvider>,
    user: UserId,
}

fn fixture(kie: ScriptedProvider, max_attempts: u32) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let kie = Arc::new(kie);
    let openai = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi));
    let providers = ProviderRegistry::new().with(kie.clone()).with(openai.clone());

    let mut config = test_config("orchestrator-key");
    config.poller = PollerConfig {
        interval: Duration::from_secs(5),
        max_attempts,
        max_concurrent: 4,
    };

    let state = AppState::with_providers(
        store.clone(),
        Arc::new(ModelCatalog::builtin().unwrap()),
        providers,
        config,
    );
    Fixture {
        state,
        store,
        kie,
        openai,
        user: UserId::generate(),
    }
}

fn kling(user: UserId) -> GenerationRequest {
    GenerationRequest {
        user_id: user,
        model_id: "kling".into(),
        prompt: "a paper boat in the rain".into(),
        options: PriceOptions {
            model_variant: Some("kling-2.6".into()),
            duration_seconds: Some(5),
            audio: Some(false),
            ..PriceOptions::default()
        },
        aspect_ratio: None,
        reference_images: Vec::new(),
        mode: None,
    }
}

fn photo(user: UserId) -> GenerationRequest {
    GenerationRequest {
        user_id: user,
        model_id: "gpt-image-1.5".into(),
        prompt: "a red kite".into(),
        options: PriceOptions {
            quality: Some("high".into()),
            ..PriceOptions::default()
        },
        aspect_ratio: None,
        reference_images: Vec::new(),
        mode: None,
    }
}

async fn wait_terminal(state: &AppState, id: &GenerationId) -> GenerationRecord {
    for _ in 0..1_000 {
        let record = state.repository.get(id).await.unwrap().unwrap();
        if record.status().is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("generation {id} never finished");
}

async fn refunds(store: &MemoryStore, id: &GenerationId) -> usize {
    store
        .transactions_for(id)
        .await
        .iter()
        .filter(|t| t.transaction_type == TransactionType::Refund)
        .count()
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn timeout_refunds_exactly_once() {
    let fx = fixture(
        ScriptedProvider::new(ProviderKind::Kie).with_polls_to_complete(u32::MAX),
        3,
    );
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();

    let submission = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    assert_eq!(submission.status, GenerationStatus::Generating);
    let charged = submission.charged_stars;
    assert!(charged > 0);
    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500 - charged);

    let record = wait_terminal(&fx.state, &submission.generation_id).await;
    assert_eq!(record.status(), GenerationStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("timeout"));
    assert_eq!(refunds(&fx.store, &submission.generation_id).await, 1);
    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);

    let job = record.job.expect("job handle kept");
    assert_eq!(fx.kie.poll_count(&job.task_id).await, 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_monitors() {
    let fx = fixture(
        ScriptedProvider::new(ProviderKind::Kie).with_polls_to_complete(u32::MAX),
        1_000,
    );
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();

    fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    assert_eq!(fx.state.poller.active().await, 1);

    fx.state.poller.shutdown().await;
    assert_eq!(fx.state.poller.active().await, 0);
}

// ============================================================================
// Balance invariant
// ============================================================================

#[tokio::test(start_paused = true)]
async fn balance_reflects_only_completed_work() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 1_000, "test").await.unwrap();

    let mut completed_charges = 0;
    for fail in [false, true, false, true] {
        if fail {
            fx.kie
                .push_polls([PollResult::failed("content policy violation")])
                .await;
        }
        let submission = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
        let record = wait_terminal(&fx.state, &submission.generation_id).await;

        let refunded = refunds(&fx.store, &submission.generation_id).await;
        if fail {
            assert_eq!(record.status(), GenerationStatus::Failed);
            assert_eq!(refunded, 1);
        } else {
            assert_eq!(record.status(), GenerationStatus::Completed);
            assert_eq!(refunded, 0);
            completed_charges += submission.charged_stars;
        }
    }

    assert_eq!(
        fx.state.ledger.get_balance(&fx.user).await.unwrap(),
        1_000 - completed_charges
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_submissions_never_overdraw() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 100, "test").await.unwrap();
    let price = fx
        .state
        .orchestrator
        .quote("gpt-image-1.5", &photo(fx.user).options)
        .stars;

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let orchestrator = Arc::clone(&fx.state.orchestrator);
            let request = photo(fx.user);
            tokio::spawn(async move { orchestrator.submit(request).await })
        })
        .collect();

    let mut accepted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(GenerationError::InsufficientCredits { .. } | GenerationError::Ledger(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let balance = fx.state.ledger.get_balance(&fx.user).await.unwrap();
    assert!(balance >= 0);
    assert!(accepted * price <= 100);
    assert_eq!(balance, 100 - accepted * price);
    assert_eq!(fx.store.generation_count().await, usize::try_from(accepted).unwrap());
}

// ============================================================================
// Write failures after the charge
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_completion_write_refunds_and_fails() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();
    fx.openai
        .push_dispatch(Ok(DispatchOutcome::Completed {
            outputs: vec![OutputRef::new("https://cdn.test/kite.png")],
        }))
        .await;
    fx.store.fail_next_updates(1).await;

    let err = fx.state.orchestrator.submit(photo(fx.user)).await.unwrap_err();
    assert!(matches!(err, GenerationError::Persistence(_)));

    let transactions = fx.state.ledger.transactions(&fx.user, 10, 0).await.unwrap();
    let generation_id = transactions
        .iter()
        .find_map(|t| t.generation_id)
        .expect("reservation recorded");
    let record = fx.state.repository.get(&generation_id).await.unwrap().unwrap();
    assert_eq!(record.status(), GenerationStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("persistence_error"));
    assert_eq!(refunds(&fx.store, &generation_id).await, 1);
    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);
}

#[tokio::test(start_paused = true)]
async fn failed_generating_write_refunds_and_fails() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();
    fx.store.fail_next_updates(1).await;

    fx.state.orchestrator.submit(kling(fx.user)).await.unwrap_err();

    assert_eq!(fx.state.poller.active().await, 0);
    let transactions = fx.state.ledger.transactions(&fx.user, 10, 0).await.unwrap();
    let generation_id = transactions.iter().find_map(|t| t.generation_id).unwrap();
    let record = fx.state.repository.get(&generation_id).await.unwrap().unwrap();
    assert_eq!(record.status(), GenerationStatus::Failed);
    assert_eq!(refunds(&fx.store, &generation_id).await, 1);
    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);
}

#[tokio::test(start_paused = true)]
async fn failed_insert_never_charges() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();
    fx.store.fail_next_inserts(1).await;

    let err = fx.state.orchestrator.submit(photo(fx.user)).await.unwrap_err();
    assert!(matches!(err, GenerationError::Persistence(_)));

    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);
    let transactions = fx.state.ledger.transactions(&fx.user, 10, 0).await.unwrap();
    assert!(transactions.iter().all(|t| t.generation_id.is_none()));
    assert_eq!(fx.store.generation_count().await, 0);
}

// ============================================================================
// Stuck generations
// ============================================================================

fn backdated(minutes: i64) -> ColumnMap {
    let mut patch = ColumnMap::new();
    patch.insert(
        columns::CREATED_AT.into(),
        json!((Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339()),
    );
    patch
}

#[tokio::test(start_paused = true)]
async fn sweep_fails_and_refunds_orphaned_jobs() {
    let fx = fixture(
        ScriptedProvider::new(ProviderKind::Kie).with_polls_to_complete(u32::MAX),
        1_000,
    );
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();

    let submission = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    // A restart leaves the record generating with nobody watching it.
    fx.state.poller.shutdown().await;
    fx.store
        .patch_generation(&submission.generation_id, backdated(180))
        .await;

    let failed = fx
        .state
        .orchestrator
        .sweep_stale(Duration::from_secs(120 * 60), 100)
        .await
        .unwrap();
    assert_eq!(failed, 1);

    let record = fx
        .state
        .repository
        .get(&submission.generation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status(), GenerationStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("stuck_generation"));
    assert_eq!(refunds(&fx.store, &submission.generation_id).await, 1);
    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);

    let again = fx
        .state
        .orchestrator
        .sweep_stale(Duration::from_secs(120 * 60), 100)
        .await
        .unwrap();
    assert_eq!(again, 0);
    assert_eq!(refunds(&fx.store, &submission.generation_id).await, 1);
}

#[tokio::test(start_paused = true)]
async fn sweep_skips_watched_and_recent_jobs() {
    let fx = fixture(
        ScriptedProvider::new(ProviderKind::Kie).with_polls_to_complete(u32::MAX),
        1_000,
    );
    fx.state.ledger.grant(&fx.user, 1_000, "test").await.unwrap();

    let watched = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    fx.store
        .patch_generation(&watched.generation_id, backdated(180))
        .await;
    let recent = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();

    let failed = fx
        .state
        .orchestrator
        .sweep_stale(Duration::from_secs(120 * 60), 100)
        .await
        .unwrap();

    assert_eq!(failed, 0);
    for id in [watched.generation_id, recent.generation_id] {
        let record = fx.state.repository.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status(), GenerationStatus::Generating);
        assert_eq!(refunds(&fx.store, &id).await, 0);
    }
    fx.state.poller.shutdown().await;
}

// ============================================================================
// Provider callbacks
// ============================================================================

#[tokio::test(start_paused = true)]
async fn callback_completes_a_watched_job() {
    let fx = fixture(
        ScriptedProvider::new(ProviderKind::Kie).with_polls_to_complete(u32::MAX),
        1_000,
    );
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();
    let submission = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    let record = fx
        .state
        .repository
        .get(&submission.generation_id)
        .await
        .unwrap()
        .unwrap();
    let task_id = record.job.unwrap().task_id;
    // Let the monitor start listening.
    tokio::task::yield_now().await;

    let ack = fx
        .state
        .orchestrator
        .handle_callback(
            &task_id,
            PollResult::completed(vec![OutputRef::new("https://cdn.test/boat.mp4")]),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.generation_id, submission.generation_id);

    let record = wait_terminal(&fx.state, &submission.generation_id).await;
    assert_eq!(record.status(), GenerationStatus::Completed);
    assert_eq!(record.outputs[0].url, "https://cdn.test/boat.mp4");
    assert_eq!(fx.kie.poll_count(&task_id).await, 0);
}

#[tokio::test(start_paused = true)]
async fn callback_failure_without_monitor_refunds_once() {
    let fx = fixture(
        ScriptedProvider::new(ProviderKind::Kie).with_polls_to_complete(u32::MAX),
        1_000,
    );
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();
    let submission = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    fx.state.poller.shutdown().await;
    let task_id = fx
        .state
        .repository
        .get(&submission.generation_id)
        .await
        .unwrap()
        .unwrap()
        .job
        .unwrap()
        .task_id;

    for _ in 0..2 {
        let ack = fx
            .state
            .orchestrator
            .handle_callback(&task_id, PollResult::failed("content policy violation"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.status, GenerationStatus::Failed);
    }

    assert_eq!(refunds(&fx.store, &submission.generation_id).await, 1);
    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);
}

#[tokio::test(start_paused = true)]
async fn late_failure_callback_keeps_completed_charge() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();
    let submission = fx.state.orchestrator.submit(kling(fx.user)).await.unwrap();
    let record = wait_terminal(&fx.state, &submission.generation_id).await;
    assert_eq!(record.status(), GenerationStatus::Completed);

    let ack = fx
        .state
        .orchestrator
        .handle_callback(&record.job.unwrap().task_id, PollResult::failed("late"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ack.status, GenerationStatus::Completed);
    assert_eq!(refunds(&fx.store, &submission.generation_id).await, 0);
    assert_eq!(
        fx.state.ledger.get_balance(&fx.user).await.unwrap(),
        500 - submission.charged_stars
    );
}

#[tokio::test]
async fn callback_for_unknown_task_is_none() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    let ack = fx
        .state
        .orchestrator
        .handle_callback("no-such-task", PollResult::failed("x"))
        .await
        .unwrap();
    assert!(ack.is_none());
}

// ============================================================================
// Modes
// ============================================================================

#[tokio::test]
async fn unsupported_mode_is_rejected_before_charging() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();

    let mut request = kling(fx.user);
    request.mode = Some(GenerationMode::StartEnd);
    let err = fx.state.orchestrator.submit(request).await.unwrap_err();
    assert!(matches!(err, GenerationError::Validation(_)));

    let mut request = kling(fx.user);
    request.mode = Some(GenerationMode::ImageToVideo);
    let err = fx.state.orchestrator.submit(request).await.unwrap_err();
    assert!(matches!(err, GenerationError::Validation(_)));

    assert_eq!(fx.state.ledger.get_balance(&fx.user).await.unwrap(), 500);
    assert_eq!(fx.store.generation_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn requested_mode_reaches_the_provider() {
    let fx = fixture(ScriptedProvider::new(ProviderKind::Kie), 10);
    fx.state.ledger.grant(&fx.user, 500, "test").await.unwrap();

    let mut request = kling(fx.user);
    request.mode = Some(GenerationMode::ImageToVideo);
    request.reference_images = vec!["https://img.test/boat.png".into()];
    fx.state.orchestrator.submit(request).await.unwrap();

    let sent = fx.kie.requests().await;
    assert_eq!(sent.last().unwrap().mode, GenerationMode::ImageToVideo);
    fx.state.poller.shutdown().await;
}
