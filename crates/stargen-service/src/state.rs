//! Application state.

use std::sync::Arc;

use stargen_core::{ModelCatalog, ProviderKind};
use stargen_providers::{
    ClientOptions, KieClient, OpenAiImagesClient, ProviderRegistry, ScriptedProvider,
};
use stargen_store::Store;

use crate::config::ServiceConfig;
use crate::dispatch::Dispatcher;
use crate::ledger::CreditLedger;
use crate::orchestrator::Orchestrator;
use crate::persistence::GenerationRepository;
use crate::poller::JobPoller;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// The model catalog.
    pub catalog: Arc<ModelCatalog>,

    /// Credit ledger.
    pub ledger: CreditLedger,

    /// Generation records.
    pub repository: Arc<GenerationRepository>,

    /// Generation orchestrator.
    pub orchestrator: Arc<Orchestrator>,

    /// Job monitors.
    pub poller: Arc<JobPoller>,
}

impl AppState {
    /// Create a new application state with providers built from `config`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, catalog: Arc<ModelCatalog>, config: ServiceConfig) -> Self {
        let providers = build_providers(&config);
        Self::with_providers(store, catalog, providers, config)
    }

    /// Create a new application state over an explicit provider registry.
    #[must_use]
    pub fn with_providers(
        store: Arc<dyn Store>,
        catalog: Arc<ModelCatalog>,
        providers: ProviderRegistry,
        config: ServiceConfig,
    ) -> Self {
        let ledger = CreditLedger::new(
            Arc::clone(&store),
            config.ledger_max_cas_attempts,
            config.starting_balance,
        );
        let repository = Arc::new(GenerationRepository::new(
            Arc::clone(&store),
            config.persist_max_attempts,
        ));
        let poller = Arc::new(JobPoller::new(providers.clone(), config.poller.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&catalog),
            config.rates.clone(),
            ledger.clone(),
            Arc::clone(&repository),
            Dispatcher::new(providers),
            Arc::clone(&poller),
        ));

        Self {
            store,
            config,
            catalog,
            ledger,
            repository,
            orchestrator,
            poller,
        }
    }
}

/// Build the provider registry the configuration asks for.
///
/// Providers without credentials are left out; requests for their models
/// fail with a configuration error instead of reaching the network.
#[must_use]
pub fn build_providers(config: &ServiceConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    if config.mock_providers {
        tracing::warn!("Mock provider mode enabled - no provider will be called");
        for kind in [ProviderKind::Kie, ProviderKind::OpenAi] {
            registry.register(Arc::new(ScriptedProvider::new(kind)));
        }
        return registry;
    }

    match &config.kie_api_key {
        Some(key) => {
            let options = ClientOptions {
                callback_url: config.kie_callback_url.clone(),
                ..ClientOptions::default()
            };
            match KieClient::new(config.kie_api_url.clone(), key.clone(), options) {
                Ok(client) => {
                    tracing::info!(kie_url = %config.kie_api_url, "KIE provider enabled");
                    registry.register(Arc::new(client));
                }
                Err(e) => tracing::error!(error = %e, "Failed to create KIE client"),
            }
        }
        None => tracing::warn!("KIE not configured - KIE models will be unavailable"),
    }

    match &config.openai_api_key {
        Some(key) => match OpenAiImagesClient::new(
            config.openai_api_url.clone(),
            key.clone(),
            &ClientOptions::default(),
        ) {
            Ok(client) => {
                tracing::info!(openai_url = %config.openai_api_url, "OpenAI provider enabled");
                registry.register(Arc::new(client));
            }
            Err(e) => tracing::error!(error = %e, "Failed to create OpenAI client"),
        },
        None => tracing::warn!("OpenAI not configured - OpenAI models will be unavailable"),
    }

    registry
}
