use std::{convert::Infallible, time::Duration};

use axum::body::Bytes;
use futures_util::Stream;
use tokio::time::sleep;

use crate::{models::NormalizedChunk, normalizer::encode_line};

/// The fixed reply: `"Hello"`, `" world"`, then a `stop` chunk.
pub fn fake_chunks() -> [NormalizedChunk; 3] {
    [
        NormalizedChunk::new(Some("fake-1".to_owned()), "Hello".to_owned(), None),
        NormalizedChunk::new(Some("fake-2".to_owned()), " world".to_owned(), None),
        NormalizedChunk::new(
            Some("fake-3".to_owned()),
            String::new(),
            Some("stop".to_owned()),
        ),
    ]
}

/// Yields the fixed chunks with `pacing` between consecutive ones.
pub fn fake_stream(pacing: Duration) -> impl Stream<Item = NormalizedChunk> + Send + 'static {
    async_stream::stream! {
        for (index, chunk) in fake_chunks().into_iter().enumerate() {
            if index > 0 {
                sleep(pacing).await;
            }
            yield chunk;
        }
    }
}

pub fn fake_body(
    pacing: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        for await chunk in fake_stream(pacing) {
            yield Ok::<Bytes, Infallible>(encode_line(&chunk));
        }
    }
}
