use std::sync::Arc;

use crate::{
    auth::{IdentityProvider, StaticTokenRegistry},
    backend::InferenceClient,
    config::RelayConfig,
    metrics::RelayMetrics,
};

#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn InferenceClient>,
    pub identity: Arc<dyn IdentityProvider>,
    pub config: Arc<RelayConfig>,
    pub metrics: Arc<RelayMetrics>,
}

impl AppState {
    pub fn new(
        client: Arc<dyn InferenceClient>,
        identity: Arc<dyn IdentityProvider>,
        config: RelayConfig,
    ) -> Self {
        Self {
            client,
            identity,
            config: Arc::new(config),
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    /// Accepts the bearer token `test-token` and uses default timings.
    pub fn new_for_tests<C>(client: Arc<C>) -> Self
    where
        C: InferenceClient + 'static,
    {
        Self::with_config_for_tests(client, RelayConfig::default())
    }

    pub fn with_config_for_tests<C>(client: Arc<C>, config: RelayConfig) -> Self
    where
        C: InferenceClient + 'static,
    {
        let client: Arc<dyn InferenceClient> = client;
        Self::new(
            client,
            Arc::new(StaticTokenRegistry::with_tokens(["test-token"])),
            config,
        )
    }
}
