use axum::body::Bytes;

use crate::models::{CompletionChunk, NormalizedChunk};

/// Maps a provider chunk onto the stable wire shape. Missing or `null`
/// fields degrade to defaults; this never fails.
pub fn normalize(chunk: &CompletionChunk) -> NormalizedChunk {
    let first_choice = chunk
        .choices
        .as_deref()
        .and_then(|choices| choices.first());

    let content = first_choice
        .and_then(|choice| choice.delta.as_ref())
        .and_then(|delta| delta.content.clone())
        .unwrap_or_default();
    let finish_reason = first_choice.and_then(|choice| choice.finish_reason.clone());

    NormalizedChunk::new(chunk.id.clone(), content, finish_reason)
}

/// One chunk as a single newline-terminated JSON line.
pub fn encode_line(chunk: &NormalizedChunk) -> Bytes {
    match serde_json::to_vec(chunk) {
        Ok(mut line) => {
            line.push(b'\n');
            Bytes::from(line)
        }
        Err(error) => {
            let fallback = serde_json::json!({
                "detail": format!("serialization error: {error}")
            });
            Bytes::from(format!("{fallback}\n"))
        }
    }
}
