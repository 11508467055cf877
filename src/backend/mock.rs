use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::backend::{CompletionStream, InferenceClient, ProviderError};
use crate::models::{ChatMessage, CompletionChunk, CompletionRequest};

/// One scripted upstream event.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(CompletionChunk),
    Fail(String),
    /// Never yields; the stream hangs until dropped.
    Stall,
}

/// Shared counters describing how the relay drove the upstream.
#[derive(Debug, Clone, Default)]
pub struct UpstreamTracker {
    opened: Arc<AtomicUsize>,
    pulls: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
    last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl UpstreamTracker {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of upstream elements requested so far.
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }
}

struct ReleaseOnDrop(Arc<AtomicBool>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
enum MockMode {
    Echo { token_delay: Duration },
    Scripted { steps: Vec<ScriptStep> },
    FailOnOpen(String),
}

/// Offline inference client for local runs and tests.
#[derive(Debug, Clone)]
pub struct MockInferenceClient {
    name: String,
    mode: MockMode,
    tracker: UpstreamTracker,
}

impl Default for MockInferenceClient {
    fn default() -> Self {
        Self {
            name: "mock".to_owned(),
            mode: MockMode::Echo {
                token_delay: Duration::from_millis(35),
            },
            tracker: UpstreamTracker::default(),
        }
    }
}

impl MockInferenceClient {
    pub fn scripted(steps: Vec<ScriptStep>) -> Self {
        Self {
            name: "mock-scripted".to_owned(),
            mode: MockMode::Scripted { steps },
            ..Self::default()
        }
    }

    /// Streams every chunk in order, then ends.
    pub fn with_chunks(chunks: Vec<CompletionChunk>) -> Self {
        Self::scripted(chunks.into_iter().map(ScriptStep::Chunk).collect())
    }

    pub fn failing_on_open(message: impl Into<String>) -> Self {
        Self {
            name: "mock-failing".to_owned(),
            mode: MockMode::FailOnOpen(message.into()),
            ..Self::default()
        }
    }

    pub fn tracker(&self) -> UpstreamTracker {
        self.tracker.clone()
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStream, ProviderError> {
        self.tracker.opened.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.tracker.last_request.lock() {
            *last = Some(request.clone());
        }

        let stream = match &self.mode {
            MockMode::FailOnOpen(message) => {
                return Err(ProviderError::Unavailable(message.clone()));
            }
            MockMode::Scripted { steps } => scripted_stream(steps.clone(), self.tracker.clone()),
            MockMode::Echo { token_delay } => echo_stream(&request, *token_delay),
        };

        debug!(backend = %self.name, request_id = %request.request_id, "mock stream prepared");
        Ok(stream)
    }
}

fn scripted_stream(steps: Vec<ScriptStep>, tracker: UpstreamTracker) -> CompletionStream {
    let release = ReleaseOnDrop(tracker.released.clone());
    let stream = async_stream::stream! {
        let _release = release;
        for step in steps {
            tracker.pulls.fetch_add(1, Ordering::SeqCst);
            match step {
                ScriptStep::Chunk(chunk) => {
                    yield Ok(chunk);
                }
                ScriptStep::Fail(message) => {
                    yield Err(ProviderError::Unavailable(message));
                    break;
                }
                ScriptStep::Stall => futures_util::future::pending::<()>().await,
            }
        }
    };
    stream.boxed()
}

fn echo_stream(request: &CompletionRequest, delay: Duration) -> CompletionStream {
    let content = render_response(&request.messages);
    let budget = request.max_tokens as usize;
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        let tokens = split_for_stream(&content);
        let truncated = tokens.len() > budget;
        for (index, token) in tokens.into_iter().take(budget).enumerate() {
            if tx
                .send(Ok(CompletionChunk::delta(format!("mock-{index}"), token)))
                .await
                .is_err()
            {
                return;
            }

            sleep(delay).await;
        }

        let finish_reason = if truncated { "length" } else { "stop" };
        let _ = tx
            .send(Ok(CompletionChunk::finish("mock-final", finish_reason)))
            .await;
    });

    ReceiverStream::new(rx).boxed()
}

fn render_response(messages: &[ChatMessage]) -> String {
    let prompt = messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.as_str())
        .unwrap_or("hello");

    format!("Mock reply: {prompt}")
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
