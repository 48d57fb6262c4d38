//! Common test utilities for stargen integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::Router;
use axum_test::{TestRequest, TestServer};

use stargen_core::{GenerationId, GenerationRecord, ModelCatalog, ProviderKind, UserId};
use stargen_providers::{ProviderRegistry, ScriptedProvider};
use stargen_service::{create_router, AppState, PollerConfig, ServiceConfig};
use stargen_store::MemoryStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Shared state, for driving the core directly.
    pub state: AppState,
    /// The in-memory store behind the service.
    pub store: Arc<MemoryStore>,
    /// Scripted stand-in for KIE.
    pub kie: Arc<ScriptedProvider>,
    /// Scripted stand-in for OpenAI.
    pub openai: Arc<ScriptedProvider>,
    /// A test user ID.
    pub test_user_id: UserId,
    /// The service API key for service-to-service requests.
    pub service_api_key: String,
}

const SERVICE_KEY: &str = "test-service-key";

/// Configuration with a fast poller.
pub fn test_config(service_api_key: &str) -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        service_api_key: Some(service_api_key.to_string()),
        poller: PollerConfig {
            interval: Duration::from_millis(5),
            max_attempts: 20,
            max_concurrent: 8,
        },
        ..ServiceConfig::default()
    }
}

impl TestHarness {
    /// Create a new test harness with a fresh store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Create a test harness over a preconfigured store.
    pub fn with_store(store: MemoryStore) -> Self {
        let catalog = ModelCatalog::builtin().expect("Failed to load catalog");
        Self::build(store, catalog, test_config(SERVICE_KEY))
    }

    /// Create a test harness over a custom catalog.
    pub fn with_catalog(catalog: ModelCatalog) -> Self {
        Self::build(MemoryStore::new(), catalog, test_config(SERVICE_KEY))
    }

    /// Create a test harness that requires `secret` on provider callbacks.
    pub fn with_callback_secret(secret: &str) -> Self {
        let mut config = test_config(SERVICE_KEY);
        config.kie_callback_secret = Some(secret.to_string());
        Self::build(
            MemoryStore::new(),
            ModelCatalog::builtin().expect("Failed to load catalog"),
            config,
        )
    }

    fn build(store: MemoryStore, catalog: ModelCatalog, config: ServiceConfig) -> Self {
        let service_api_key = config.service_api_key.clone().unwrap_or_default();
        let store = Arc::new(store);
        let kie = Arc::new(ScriptedProvider::new(ProviderKind::Kie));
        let openai = Arc::new(ScriptedProvider::new(ProviderKind::OpenAi));
        let providers = ProviderRegistry::new()
            .with(kie.clone())
            .with(openai.clone());

        let state = AppState::with_providers(
            store.clone(),
            Arc::new(catalog),
            providers,
            config,
        );
        let router: Router = create_router(state.clone());
        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            state,
            store,
            kie,
            openai,
            test_user_id: UserId::generate(),
            service_api_key,
        }
    }

    /// The `X-API-Key` header.
    pub fn api_key_header(&self) -> (HeaderName, HeaderValue) {
        (
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(&self.service_api_key).expect("valid header"),
        )
    }

    /// An authenticated GET request.
    pub fn get(&self, path: &str) -> TestRequest {
        let (name, value) = self.api_key_header();
        self.server.get(path).add_header(name, value)
    }

    /// An authenticated POST request.
    pub fn post(&self, path: &str) -> TestRequest {
        let (name, value) = self.api_key_header();
        self.server.post(path).add_header(name, value)
    }

    /// Give the test user `stars`.
    pub async fn fund(&self, stars: i64) {
        self.state
            .ledger
            .grant(&self.test_user_id, stars, "test funding")
            .await
            .expect("Failed to fund test user");
    }

    /// The test user's balance.
    pub async fn balance(&self) -> i64 {
        self.state
            .ledger
            .get_balance(&self.test_user_id)
            .await
            .expect("Failed to read balance")
    }

    /// Wait until a generation reaches a terminal status.
    pub async fn wait_terminal(&self, id: &GenerationId) -> GenerationRecord {
        for _ in 0..500 {
            let record = self
                .state
                .repository
                .get(id)
                .await
                .expect("Failed to read generation")
                .expect("Generation disappeared");
            if record.status().is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation {id} never finished");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
