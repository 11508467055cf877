use std::{env, time::Duration};

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    backend::{CompletionStream, InferenceClient, ProviderError},
    models::{CompletionChunk, CompletionRequest},
};

const DEFAULT_MODEL: &str = "meta-llama/Meta-Llama-3-8B-Instruct";
const DEFAULT_BASE_URL: &str = "https://router.huggingface.co/v1";

/// Streaming chat completions against the Hugging Face inference router.
#[derive(Clone)]
pub struct HuggingFaceClient {
    client: reqwest::Client,
    access_token: String,
    base_url: String,
    model: String,
}

impl HuggingFaceClient {
    /// Returns `Ok(None)` when no access token is configured.
    pub fn from_env() -> Result<Option<Self>, String> {
        let Some(access_token) = env::var("HUGGING_FACE_ACCESS_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty())
        else {
            return Ok(None);
        };
        let base_url = env::var("HUGGING_FACE_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        let model = env::var("HUGGING_FACE_MODEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_owned());
        let connect_timeout_secs = env::var("HUGGING_FACE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(10);

        // No overall request timeout: it would cut long streams. The relay
        // bounds idle reads and total lifetime instead.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .build()
            .map_err(|error| format!("failed to build Hugging Face HTTP client: {error}"))?;

        Ok(Some(Self {
            client,
            access_token: access_token.trim().to_owned(),
            base_url,
            model,
        }))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl InferenceClient for HuggingFaceClient {
    fn name(&self) -> &str {
        "huggingface"
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        let payload = json!({
            "model": self.model,
            "messages": &request.messages,
            "max_tokens": request.max_tokens,
            "stream": true
        });

        let response = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.access_token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown provider error".to_owned());
            return Err(map_http_error(status, body));
        }

        let stream = sse_chunks(response.bytes_stream());

        debug!(
            backend = self.name(),
            model = %self.model,
            request_id = %request.request_id,
            "upstream stream opened"
        );
        Ok(stream)
    }
}

/// Splits an SSE byte stream into completion chunks.
///
/// Lines are cut on raw bytes before decoding, so a multi-byte character
/// split across reads survives. The stream ends at `[DONE]`, at the end of
/// the body, or after yielding the first error.
fn sse_chunks<S, E>(upstream: S) -> CompletionStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut buffer: Vec<u8> = Vec::new();

        'read: while let Some(next) = upstream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(error) => {
                    yield Err(error.into());
                    break;
                }
            };
            buffer.extend_from_slice(&bytes);

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let raw_line = buffer.drain(..=index).collect::<Vec<u8>>();
                let line = match std::str::from_utf8(&raw_line) {
                    Ok(line) => line.trim(),
                    Err(error) => {
                        yield Err(ProviderError::InvalidResponse(error.to_string()));
                        break 'read;
                    }
                };

                match parse_event_line(line) {
                    SseLine::Skip => continue,
                    SseLine::Done => break 'read,
                    SseLine::Chunk(chunk) => {
                        yield Ok(chunk);
                    }
                    SseLine::Failed(error) => {
                        yield Err(error);
                        break 'read;
                    }
                }
            }
        }
    };
    stream.boxed()
}

#[derive(Debug)]
enum SseLine {
    Skip,
    Done,
    Chunk(CompletionChunk),
    Failed(ProviderError),
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(flatten)]
    chunk: CompletionChunk,
}

fn parse_event_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return SseLine::Skip;
    }
    if payload == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(StreamEvent {
            error: Some(error), ..
        }) => SseLine::Failed(ProviderError::InvalidResponse(format!(
            "provider reported error mid-stream: {error}"
        ))),
        Ok(event) => SseLine::Chunk(event.chunk),
        Err(error) => SseLine::Failed(ProviderError::InvalidResponse(error.to_string())),
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout(error.to_string())
        } else {
            ProviderError::Unavailable(error.to_string())
        }
    }
}

fn map_http_error(status: StatusCode, body: String) -> ProviderError {
    let trimmed = body.chars().take(400).collect::<String>();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderError::Timeout(format!("upstream timeout: {trimmed}"))
        }
        _ => ProviderError::Status {
            status: status.as_u16(),
            body: trimmed,
        },
    }
}
