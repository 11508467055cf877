use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::{self, UserIdentity},
    errors::AppError,
    fake::fake_body,
    models::ChatRequest,
    relay::{collect_completion, relay_chat, stream_response},
    state::AppState,
};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

/// The body is taken raw so authentication runs before validation.
pub async fn chat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match process_chat(state.clone(), headers, body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state
        .metrics
        .observe_request("/chat", "POST", response.status().as_u16(), started.elapsed());
    response
}

async fn process_chat(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let identity = authorize(&state, &headers).await?;
    let request = ChatRequest::from_body(&body)?;
    let request_id = new_request_id();

    info!(
        request_id = %request_id,
        subject = %identity.subject,
        backend = state.client.name(),
        messages = request.messages.len(),
        stream = request.stream,
        "chat request accepted"
    );

    if request.stream {
        relay_chat(state, request_id, request.messages).await
    } else {
        collect_completion(state, request_id, request.messages).await
    }
}

pub async fn fake_stream(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();

    let response = match authorize(&state, &headers).await {
        Ok(identity) => {
            info!(
                request_id = %new_request_id(),
                subject = %identity.subject,
                "fake stream requested"
            );
            let body = Body::from_stream(fake_body(state.config.fake_stream_pacing));
            stream_response(body).unwrap_or_else(IntoResponse::into_response)
        }
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/chat/fake-stream",
        "GET",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<UserIdentity, AppError> {
    auth::authenticate(state.identity.as_ref(), headers)
        .await
        .map_err(|error| {
            info!(error = %error, "rejected unauthenticated request");
            AppError::from(error)
        })
}

fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4())
}
