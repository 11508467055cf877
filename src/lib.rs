pub mod auth;
pub mod backend;
pub mod config;
pub mod errors;
pub mod fake;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod relay;
pub mod state;

use std::sync::Arc;

use auth::StaticTokenRegistry;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use backend::{huggingface::HuggingFaceClient, mock::MockInferenceClient, InferenceClient};
use config::RelayConfig;
use tracing::{info, warn};

/// Builds the shared state once at startup from the environment.
pub fn build_state(config: RelayConfig) -> Result<state::AppState, std::io::Error> {
    let client: Arc<dyn InferenceClient> =
        match HuggingFaceClient::from_env().map_err(std::io::Error::other)? {
            Some(client) => {
                info!(model = client.model(), "using Hugging Face inference client");
                Arc::new(client)
            }
            None => {
                warn!("HUGGING_FACE_ACCESS_TOKEN not set, falling back to mock inference client");
                Arc::new(MockInferenceClient::default())
            }
        };

    info!(
        backend = client.name(),
        max_tokens = config.max_tokens,
        idle_timeout_secs = config.upstream_idle_timeout.as_secs(),
        max_lifetime_secs = config.max_stream_lifetime.as_secs(),
        "relay configured"
    );
    Ok(state::AppState::new(
        client,
        Arc::new(StaticTokenRegistry::from_env()),
        config,
    ))
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Chat bodies are unbounded so authentication always runs first.
        .route("/chat", post(handlers::chat).layer(DefaultBodyLimit::disable()))
        .route("/chat/fake-stream", get(handlers::fake_stream))
        .with_state(state)
}
