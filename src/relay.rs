//! Relays an upstream completion stream to the client as newline-delimited
//! JSON, one normalized chunk per line.
//!
//! The body is pull-driven: the next upstream chunk is requested only when
//! the transport polls for the next frame, so a slow client slows the
//! upstream and a disconnected client stops it. Failures before the first
//! chunk become a plain `500`; failures after it end the stream with a
//! `finish_reason: "error"` chunk.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    http::{
        self,
        header::{CACHE_CONTROL, CONTENT_TYPE},
        StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::{
    backend::{CompletionStream, ProviderError},
    errors::AppError,
    metrics::RelayMetrics,
    models::{ChatCompletion, ChatMessage, CompletionChunk, CompletionRequest, NormalizedChunk},
    normalizer::{encode_line, normalize},
    state::AppState,
};

pub const STREAM_CONTENT_TYPE: &str = "text/event-stream";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("upstream sent nothing for {0:?}")]
    IdleTimeout(Duration),
    #[error("stream exceeded maximum lifetime of {0:?}")]
    LifetimeExceeded(Duration),
}

impl RelayError {
    fn stage(&self) -> &'static str {
        match self {
            RelayError::Provider(_) => "provider",
            RelayError::IdleTimeout(_) => "idle_timeout",
            RelayError::LifetimeExceeded(_) => "lifetime",
        }
    }
}

impl From<RelayError> for AppError {
    fn from(error: RelayError) -> Self {
        AppError::Provider(error.to_string())
    }
}

/// Pull handle over an upstream stream with explicit close.
///
/// Every `next()` is bounded by the idle timeout and by the stream's overall
/// deadline, counted from `started` so time spent opening the upstream is
/// included. Once the upstream ends, fails or is closed, the stream is
/// dropped and `next()` keeps returning `Ok(None)`.
pub struct UpstreamCursor {
    stream: Option<CompletionStream>,
    idle_timeout: Duration,
    max_lifetime: Duration,
    deadline: Instant,
    pulls: usize,
}

impl UpstreamCursor {
    pub fn new(
        stream: CompletionStream,
        idle_timeout: Duration,
        max_lifetime: Duration,
        started: Instant,
    ) -> Self {
        Self {
            stream: Some(stream),
            idle_timeout,
            max_lifetime,
            deadline: started + max_lifetime,
            pulls: 0,
        }
    }

    pub async fn next(&mut self) -> Result<Option<CompletionChunk>, RelayError> {
        if self.stream.is_none() {
            return Ok(None);
        }

        let now = Instant::now();
        if now >= self.deadline {
            self.close();
            return Err(RelayError::LifetimeExceeded(self.max_lifetime));
        }
        let wait = self.idle_timeout.min(self.deadline - now);

        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        self.pulls += 1;
        let outcome = timeout(wait, stream.next()).await;

        match outcome {
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(error))) => {
                self.close();
                Err(error.into())
            }
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(_) => {
                self.close();
                if wait < self.idle_timeout {
                    Err(RelayError::LifetimeExceeded(self.max_lifetime))
                } else {
                    Err(RelayError::IdleTimeout(self.idle_timeout))
                }
            }
        }
    }

    /// Drops the upstream stream, releasing its connection.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(pulls = self.pulls, "upstream released");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn pulls(&self) -> usize {
        self.pulls
    }
}

async fn open_upstream(
    state: &AppState,
    request: CompletionRequest,
) -> Result<UpstreamCursor, RelayError> {
    let started = Instant::now();
    let idle = state.config.upstream_idle_timeout;
    let lifetime = state.config.max_stream_lifetime;
    let stream = timeout(idle.min(lifetime), state.client.stream_completion(request))
        .await
        .map_err(|_| {
            if lifetime < idle {
                RelayError::LifetimeExceeded(lifetime)
            } else {
                RelayError::IdleTimeout(idle)
            }
        })??;
    Ok(UpstreamCursor::new(stream, idle, lifetime, started))
}

fn completion_request(
    state: &AppState,
    request_id: &str,
    messages: Vec<ChatMessage>,
) -> CompletionRequest {
    CompletionRequest {
        request_id: request_id.to_owned(),
        messages,
        max_tokens: state.config.max_tokens,
    }
}

/// Streams the upstream reply for `messages` as NDJSON.
pub async fn relay_chat(
    state: AppState,
    request_id: String,
    messages: Vec<ChatMessage>,
) -> Result<Response, AppError> {
    let request = completion_request(&state, &request_id, messages);
    let mut cursor = open_upstream(&state, request).await.map_err(|error| {
        state.metrics.observe_upstream_error("open");
        warn!(request_id = %request_id, error = %error, "failed to open upstream stream");
        AppError::from(error)
    })?;

    // The status is committed once this function returns, so the first
    // chunk is pulled here to keep early provider failures a clean 500.
    let first = cursor.next().await.map_err(|error| {
        state.metrics.observe_upstream_error("first_read");
        warn!(request_id = %request_id, error = %error, "upstream failed before first chunk");
        AppError::from(error)
    })?;

    let body = match first {
        Some(first) => Body::from_stream(relay_body(
            cursor,
            first,
            state.metrics.clone(),
            request_id,
        )),
        None => {
            debug!(request_id = %request_id, "upstream ended without chunks");
            Body::empty()
        }
    };

    stream_response(body)
}

pub fn stream_response(body: Body) -> Result<Response, AppError> {
    http::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .header(CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|error| AppError::Internal(format!("failed to build stream response: {error}")))
}

/// Tracks one relayed stream; a drop before `finish` means the client went away.
struct StreamWatch {
    metrics: Arc<RelayMetrics>,
    request_id: String,
    relayed: usize,
    finished: bool,
}

impl StreamWatch {
    fn record(&mut self) {
        self.relayed += 1;
        self.metrics.observe_chunk_relayed();
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for StreamWatch {
    fn drop(&mut self) {
        if self.finished {
            debug!(request_id = %self.request_id, chunks = self.relayed, "stream completed");
        } else {
            self.metrics.observe_client_disconnect();
            info!(
                request_id = %self.request_id,
                chunks = self.relayed,
                "client disconnected, upstream released"
            );
        }
    }
}

pub fn relay_body(
    mut cursor: UpstreamCursor,
    first: CompletionChunk,
    metrics: Arc<RelayMetrics>,
    request_id: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let mut watch = StreamWatch {
        metrics: metrics.clone(),
        request_id: request_id.clone(),
        relayed: 0,
        finished: false,
    };

    async_stream::stream! {
        let mut last_id = first.id.clone();
        watch.record();
        yield Ok::<Bytes, Infallible>(encode_line(&normalize(&first)));

        loop {
            match cursor.next().await {
                Ok(Some(chunk)) => {
                    if chunk.id.is_some() {
                        last_id = chunk.id.clone();
                    }
                    watch.record();
                    yield Ok::<Bytes, Infallible>(encode_line(&normalize(&chunk)));
                }
                Ok(None) => break,
                Err(error) => {
                    metrics.observe_upstream_error(error.stage());
                    warn!(
                        request_id = %request_id,
                        error = %error,
                        chunks = watch.relayed,
                        "upstream failed mid-stream, sending terminal chunk"
                    );
                    watch.finish();
                    let sentinel = NormalizedChunk::terminal_error(last_id.clone());
                    yield Ok::<Bytes, Infallible>(encode_line(&sentinel));
                    break;
                }
            }
        }

        cursor.close();
        watch.finish();
    }
}

/// Drains the upstream into a single `chat.completion` body.
pub async fn collect_completion(
    state: AppState,
    request_id: String,
    messages: Vec<ChatMessage>,
) -> Result<Response, AppError> {
    let request = completion_request(&state, &request_id, messages);
    let mut cursor = open_upstream(&state, request).await.map_err(|error| {
        state.metrics.observe_upstream_error("open");
        warn!(request_id = %request_id, error = %error, "failed to open upstream stream");
        AppError::from(error)
    })?;

    let mut id = None;
    let mut content = String::new();
    let mut finish_reason = None;
    loop {
        let chunk = match cursor.next().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(error) => {
                state.metrics.observe_upstream_error(error.stage());
                warn!(request_id = %request_id, error = %error, "upstream failed while collecting");
                return Err(error.into());
            }
        };

        let normalized = normalize(&chunk);
        content.push_str(normalized.content());
        if let Some(reason) = normalized.finish_reason() {
            finish_reason = Some(reason.to_owned());
        }
        if id.is_none() {
            id = normalized.id;
        }
    }

    debug!(request_id = %request_id, pulls = cursor.pulls(), "completion collected");
    Ok(Json(ChatCompletion::new(id, content, finish_reason)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        mock::{MockInferenceClient, ScriptStep, UpstreamTracker},
        InferenceClient,
    };

    async fn scripted_cursor(
        steps: Vec<ScriptStep>,
        idle: Duration,
        lifetime: Duration,
    ) -> (UpstreamCursor, UpstreamTracker) {
        let client = MockInferenceClient::scripted(steps);
        let tracker = client.tracker();
        let stream = client
            .stream_completion(CompletionRequest {
                request_id: "req_unit".to_owned(),
                messages: Vec::new(),
                max_tokens: 20,
            })
            .await
            .expect("scripted stream opens");
        (
            UpstreamCursor::new(stream, idle, lifetime, Instant::now()),
            tracker,
        )
    }

    fn parse_lines(frames: &[Bytes]) -> Vec<NormalizedChunk> {
        frames
            .iter()
            .map(|frame| {
                assert_eq!(frame.last(), Some(&b'\n'), "every frame is one full line");
                serde_json::from_slice(&frame[..frame.len() - 1]).expect("frame is JSON")
            })
            .collect()
    }

    #[tokio::test]
    async fn cursor_stops_pulling_after_end() {
        let (mut cursor, tracker) = scripted_cursor(
            vec![ScriptStep::Chunk(CompletionChunk::delta("a", "x"))],
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;

        assert!(cursor.next().await.expect("first").is_some());
        assert!(cursor.next().await.expect("end").is_none());
        assert!(cursor.is_closed());
        assert!(tracker.released());
        assert!(cursor.next().await.expect("still ended").is_none());
        assert_eq!(cursor.pulls(), 2);
    }

    #[tokio::test]
    async fn cursor_reports_idle_timeout_and_releases() {
        let (mut cursor, tracker) = scripted_cursor(
            vec![
                ScriptStep::Chunk(CompletionChunk::delta("a", "x")),
                ScriptStep::Stall,
            ],
            Duration::from_millis(30),
            Duration::from_secs(5),
        )
        .await;

        assert!(cursor.next().await.expect("first").is_some());
        let error = cursor.next().await.expect_err("stall should time out");
        assert!(matches!(error, RelayError::IdleTimeout(_)));
        assert!(tracker.released());
    }

    #[tokio::test]
    async fn cursor_enforces_lifetime() {
        let (mut cursor, _tracker) = scripted_cursor(
            vec![ScriptStep::Stall],
            Duration::from_secs(5),
            Duration::from_millis(30),
        )
        .await;

        let error = cursor.next().await.expect_err("lifetime should expire");
        assert!(matches!(error, RelayError::LifetimeExceeded(_)));
    }

    #[tokio::test]
    async fn lifetime_counts_time_spent_opening_upstream() {
        let started = Instant::now();
        let (stream_cursor, tracker) = scripted_cursor(
            vec![ScriptStep::Chunk(CompletionChunk::delta("late", "x"))],
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await;
        // Slow open: the stream arrives after the whole lifetime has passed.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let stream = stream_cursor
            .stream
            .expect("scripted cursor holds a stream");
        let mut cursor = UpstreamCursor::new(
            stream,
            Duration::from_secs(5),
            Duration::from_millis(30),
            started,
        );

        let error = cursor.next().await.expect_err("lifetime already spent");
        assert!(matches!(error, RelayError::LifetimeExceeded(_)));
        assert_eq!(tracker.pulls(), 0);
        assert!(cursor.is_closed());
        assert!(tracker.released());
    }

    #[tokio::test]
    async fn relay_body_preserves_order_and_count() {
        let total = 25;
        let chunks = (0..total)
            .map(|index| CompletionChunk::delta(format!("c{index}"), format!("t{index}")))
            .collect::<Vec<_>>();
        let (mut cursor, _tracker) = scripted_cursor(
            chunks.into_iter().map(ScriptStep::Chunk).collect(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        let first = cursor
            .next()
            .await
            .expect("first pull")
            .expect("first chunk");
        let metrics = Arc::new(RelayMetrics::new());

        let frames = relay_body(cursor, first, metrics.clone(), "req_order".to_owned())
            .map(|frame| match frame {
                Ok(bytes) => bytes,
                Err(never) => match never {},
            })
            .collect::<Vec<_>>()
            .await;
        let lines = parse_lines(&frames);

        assert_eq!(lines.len(), total);
        for (index, line) in lines.iter().enumerate() {
            assert_eq!(line.id.as_deref(), Some(format!("c{index}").as_str()));
            assert_eq!(line.content(), format!("t{index}"));
        }
        assert_eq!(metrics.chunks_relayed(), total as u64);
        assert_eq!(metrics.client_disconnects(), 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_ends_with_error_sentinel() {
        let (mut cursor, tracker) = scripted_cursor(
            vec![
                ScriptStep::Chunk(CompletionChunk::delta("s1", "par")),
                ScriptStep::Chunk(CompletionChunk::delta("s2", "tial")),
                ScriptStep::Fail("connection reset".to_owned()),
                ScriptStep::Chunk(CompletionChunk::delta("never", "sent")),
            ],
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        let first = cursor.next().await.expect("pull").expect("chunk");
        let metrics = Arc::new(RelayMetrics::new());

        let frames = relay_body(cursor, first, metrics.clone(), "req_fail".to_owned())
        .filter_map(|frame| async move { frame.ok() })
        .collect::<Vec<_>>()
        .await;
        let lines = parse_lines(&frames);

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].content(), "tial");
        let last = &lines[2];
        assert_eq!(last.id.as_deref(), Some("s2"));
        assert_eq!(last.content(), "");
        assert_eq!(last.finish_reason(), Some("error"));
        assert_eq!(tracker.pulls(), 3);
        assert!(tracker.released());
        assert_eq!(metrics.chunks_relayed(), 2);
        assert_eq!(metrics.client_disconnects(), 0);
    }

    #[tokio::test]
    async fn dropping_body_counts_disconnect_and_releases_upstream() {
        let (mut cursor, tracker) = scripted_cursor(
            vec![
                ScriptStep::Chunk(CompletionChunk::delta("d1", "a")),
                ScriptStep::Chunk(CompletionChunk::delta("d2", "b")),
                ScriptStep::Chunk(CompletionChunk::delta("d3", "c")),
            ],
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await;
        let first = cursor.next().await.expect("pull").expect("chunk");
        let metrics = Arc::new(RelayMetrics::new());

        let mut body = Box::pin(relay_body(
            cursor,
            first,
            metrics.clone(),
            "req_drop".to_owned(),
        ));
        assert!(body.next().await.is_some());
        drop(body);

        assert_eq!(tracker.pulls(), 1);
        assert!(tracker.released());
        assert_eq!(metrics.client_disconnects(), 1);
    }
}
