use serde::{Deserialize, Serialize};

use crate::errors::AppError;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_role() -> String {
    "user".to_owned()
}

fn default_stream() -> bool {
    true
}

impl ChatRequest {
    /// Parses and validates a raw `/chat` body. Every failure is a
    /// validation error so the upstream is never contacted for bad input.
    pub fn from_body(body: &[u8]) -> Result<Self, AppError> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|error| AppError::Validation(format!("invalid chat request: {error}")))?;
        if request.messages.is_empty() {
            return Err(AppError::Validation(
                "messages must not be empty".to_owned(),
            ));
        }
        Ok(request)
    }
}

/// What the relay asks the inference client for.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub request_id: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

/// Provider chunk as received. Every field may be missing or `null`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Option<Vec<UpstreamChoice>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamChoice {
    #[serde(default)]
    pub delta: Option<UpstreamDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl CompletionChunk {
    pub fn delta(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            choices: Some(vec![UpstreamChoice {
                delta: Some(UpstreamDelta {
                    content: Some(content.into()),
                }),
                finish_reason: None,
            }]),
        }
    }

    pub fn finish(id: impl Into<String>, finish_reason: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            choices: Some(vec![UpstreamChoice {
                delta: Some(UpstreamDelta::default()),
                finish_reason: Some(finish_reason.into()),
            }]),
        }
    }
}

/// Wire form of one streamed chunk, written as a single JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedChunk {
    pub id: Option<String>,
    pub object: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub content: String,
}

impl NormalizedChunk {
    pub fn new(id: Option<String>, content: String, finish_reason: Option<String>) -> Self {
        Self {
            id,
            object: CHUNK_OBJECT.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { content },
                finish_reason,
            }],
        }
    }

    /// Sentinel emitted when the stream has to end abnormally after the
    /// response was already committed.
    pub fn terminal_error(id: Option<String>) -> Self {
        Self::new(id, String::new(), Some("error".to_owned()))
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|choice| choice.delta.content.as_str())
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }
}

/// Aggregated reply for `"stream": false` requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: Option<String>,
    pub object: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

impl ChatCompletion {
    pub fn new(id: Option<String>, content: String, finish_reason: Option<String>) -> Self {
        Self {
            id,
            object: COMPLETION_OBJECT.to_owned(),
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_owned(),
                    content,
                },
                finish_reason,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_role_and_stream() {
        let request = ChatRequest::from_body(br#"{"messages":[{"content":"hi"}]}"#)
            .expect("body should parse");

        assert!(request.stream);
        assert_eq!(request.messages[0].role, "user");
    }

    #[test]
    fn request_validation_rejects_bad_shapes() {
        let bodies: [&[u8]; 5] = [
            br#"{}"#,
            br#"{"messages":"hello"}"#,
            br#"{"messages":[{"role":"user"}]}"#,
            br#"{"messages":[]}"#,
            b"not json",
        ];

        for body in bodies {
            let error = ChatRequest::from_body(body).expect_err("body should be rejected");
            assert!(matches!(error, AppError::Validation(_)));
        }
    }

    #[test]
    fn arbitrary_roles_are_accepted() {
        let request = ChatRequest::from_body(
            br#"{"messages":[{"role":"narrator","content":"x"}],"stream":false}"#,
        )
        .expect("body should parse");

        assert!(!request.stream);
        assert_eq!(request.messages[0].role, "narrator");
    }

    #[test]
    fn normalized_chunk_serializes_nulls() {
        let chunk = NormalizedChunk::new(None, String::new(), None);
        let value = serde_json::to_value(&chunk).expect("chunk serializes");

        assert_eq!(
            value,
            serde_json::json!({
                "id": null,
                "object": "chat.completion.chunk",
                "choices": [{"index": 0, "delta": {"content": ""}, "finish_reason": null}]
            })
        );
    }
}
