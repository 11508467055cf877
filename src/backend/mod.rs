pub mod huggingface;
pub mod mock;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::{CompletionChunk, CompletionRequest};

/// Lazy upstream sequence. Dropping it releases the upstream connection.
pub type CompletionStream = BoxStream<'static, Result<CompletionChunk, ProviderError>>;

#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn name(&self) -> &str;
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError>;
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider timeout: {0}")]
    Timeout(String),
    #[error("provider invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
}
