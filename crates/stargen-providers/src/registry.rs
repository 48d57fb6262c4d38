//! Provider lookup by kind.

use std::collections::HashMap;
use std::sync::Arc;

use stargen_core::ProviderKind;

use crate::client::ProviderClient;
use crate::error::{ProviderError, Result};

/// Configured provider clients, one per kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<ProviderKind, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its own kind, replacing any previous one.
    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.kind(), client);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, client: Arc<dyn ProviderClient>) -> Self {
        self.register(client);
        self
    }

    /// The client for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Configuration` if no client is registered.
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderClient>> {
        self.clients.get(&kind).cloned().ok_or_else(|| {
            ProviderError::Configuration(format!("no client configured for provider {}", kind.as_str()))
        })
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.clients.keys().copied()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.clients.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedProvider;

    #[test]
    fn lookup_by_kind() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(ScriptedProvider::new(ProviderKind::Kie)));

        assert_eq!(registry.get(ProviderKind::Kie).unwrap().kind(), ProviderKind::Kie);
        assert!(matches!(
            registry.get(ProviderKind::OpenAi),
            Err(ProviderError::Configuration(_))
        ));
        assert_eq!(registry.kinds().count(), 1);
    }
}
