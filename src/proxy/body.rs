//! # Body Transport
//!
//! [`BufferFlow`] carries the body of one request or response. It holds either a
//! materialized buffer or a live chunk stream, never both as authoritative.
//!
//! The mode is decided once when the flow is built:
//! - **Buffered**: the stream is collected on first access and every body
//!   operation works on the materialized bytes
//! - **Streaming**: chunks pass through untouched; `set_body` and `on_body` are
//!   no-ops, `body()` is `None` and `body_or_empty()` is empty

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{Future, StreamExt};
use std::fmt;
use tracing::debug;

use crate::core::definition::BodyModeSetting;
use crate::core::error::{GatewayError, GatewayResult};

/// Stream of body chunks
pub type ChunkStream = BoxStream<'static, GatewayResult<Bytes>>;

/// Transport mode of a body, fixed for the lifetime of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    Buffered,
    Streaming,
}

impl BodyMode {
    /// Decide the mode for a message
    ///
    /// Event streams and ndjson always stream. In `auto`, the body is buffered
    /// only when some resolved step needs it whole.
    pub fn resolve(setting: BodyModeSetting, content_type: Option<&str>, needs_body: bool) -> Self {
        if content_type.map(is_stream_content_type).unwrap_or(false) {
            return Self::Streaming;
        }
        match setting {
            BodyModeSetting::Buffered => Self::Buffered,
            BodyModeSetting::Streaming => Self::Streaming,
            BodyModeSetting::Auto if needs_body => Self::Buffered,
            BodyModeSetting::Auto => Self::Streaming,
        }
    }
}

/// Content types whose bodies are unbounded message streams
pub fn is_stream_content_type(content_type: &str) -> bool {
    matches!(
        content_type,
        "text/event-stream" | "application/x-ndjson" | "application/stream+json"
    )
}

enum BodyState {
    Empty,
    Chunks(ChunkStream),
    Materialized(Bytes),
}

/// Body of one message, buffered or streamed
pub struct BufferFlow {
    mode: BodyMode,
    state: BodyState,
    limit: Option<usize>,
}

impl fmt::Debug for BufferFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            BodyState::Empty => "empty",
            BodyState::Chunks(_) => "chunks",
            BodyState::Materialized(_) => "materialized",
        };
        f.debug_struct("BufferFlow")
            .field("mode", &self.mode)
            .field("state", &state)
            .finish()
    }
}

impl BufferFlow {
    pub fn new(chunks: Option<ChunkStream>, mode: BodyMode) -> Self {
        Self {
            mode,
            state: chunks.map(BodyState::Chunks).unwrap_or(BodyState::Empty),
            limit: None,
        }
    }

    pub fn empty(mode: BodyMode) -> Self {
        Self::new(None, mode)
    }

    /// Cap on the number of bytes collected when materializing
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn mode(&self) -> BodyMode {
        self.mode
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn is_streaming(&self) -> bool {
        self.mode == BodyMode::Streaming
    }

    /// Whether a chunk source was supplied or a body was set
    pub fn has_chunks(&self) -> bool {
        !matches!(self.state, BodyState::Empty)
    }

    /// Length of the materialized body, when there is one
    pub fn materialized_len(&self) -> Option<usize> {
        match &self.state {
            BodyState::Materialized(body) => Some(body.len()),
            BodyState::Empty if self.mode == BodyMode::Buffered => Some(0),
            _ => None,
        }
    }

    /// The whole body; `None` when streaming or when there is nothing to read
    pub async fn body(&mut self) -> GatewayResult<Option<Bytes>> {
        if self.mode == BodyMode::Streaming {
            return Ok(None);
        }
        match std::mem::replace(&mut self.state, BodyState::Empty) {
            BodyState::Empty => Ok(None),
            BodyState::Materialized(body) => {
                self.state = BodyState::Materialized(body.clone());
                Ok(Some(body))
            }
            BodyState::Chunks(chunks) => {
                let body = collect(chunks, self.limit).await?;
                self.state = BodyState::Materialized(body.clone());
                Ok(Some(body))
            }
        }
    }

    /// Replace the body; ignored in streaming mode
    pub fn set_body(&mut self, body: Bytes) {
        if self.mode == BodyMode::Streaming {
            debug!("Ignoring body replacement on a streamed message");
            return;
        }
        self.state = BodyState::Materialized(body);
    }

    /// Transform the whole body; ignored in streaming mode
    ///
    /// An absent body is handed to the callback as empty bytes.
    pub async fn on_body<F, Fut>(&mut self, f: F) -> GatewayResult<()>
    where
        F: FnOnce(Bytes) -> Fut,
        Fut: Future<Output = GatewayResult<Bytes>>,
    {
        if self.mode == BodyMode::Streaming {
            return Ok(());
        }
        let current = self.body().await?.unwrap_or_default();
        let transformed = f(current).await?;
        self.set_body(transformed);
        Ok(())
    }

    /// The whole body, empty when streaming or absent
    pub async fn body_or_empty(&mut self) -> GatewayResult<Bytes> {
        Ok(self.body().await?.unwrap_or_default())
    }

    /// The body as a chunk stream
    ///
    /// Buffered bodies yield one chunk holding the materialized bytes and stay
    /// readable. Streamed bodies hand over the live stream, which can be taken
    /// only once.
    pub async fn chunks(&mut self) -> GatewayResult<ChunkStream> {
        match self.mode {
            BodyMode::Buffered => match self.body().await? {
                Some(body) if !body.is_empty() => Ok(stream::once(async move { Ok(body) }).boxed()),
                _ => Ok(stream::empty().boxed()),
            },
            BodyMode::Streaming => match std::mem::replace(&mut self.state, BodyState::Empty) {
                BodyState::Chunks(chunks) => Ok(chunks),
                BodyState::Materialized(body) => {
                    Ok(stream::once(async move { Ok(body) }).boxed())
                }
                BodyState::Empty => Ok(stream::empty().boxed()),
            },
        }
    }

    /// Attach a new chunk source, replacing whatever was there
    pub fn set_chunks(&mut self, chunks: ChunkStream) {
        self.state = BodyState::Chunks(chunks);
    }

    /// Wrap the live stream of a streamed body; ignored in buffered mode
    pub fn map_chunks<F>(&mut self, f: F)
    where
        F: FnOnce(ChunkStream) -> ChunkStream,
    {
        if self.mode != BodyMode::Streaming {
            return;
        }
        if let BodyState::Chunks(chunks) = std::mem::replace(&mut self.state, BodyState::Empty) {
            self.state = BodyState::Chunks(f(chunks));
        }
    }
}

async fn collect(mut chunks: ChunkStream, limit: Option<usize>) -> GatewayResult<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        if let Some(limit) = limit {
            if buffer.len() + chunk.len() > limit {
                return Err(GatewayError::BodyTooLarge { limit });
            }
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(parts: &[&'static str]) -> ChunkStream {
        let items: Vec<GatewayResult<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        stream::iter(items).boxed()
    }

    async fn drain(chunks: ChunkStream) -> Vec<Bytes> {
        chunks.map(|c| c.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_buffered_set_body_then_body() {
        let mut flow = BufferFlow::new(Some(source(&["a", "b"])), BodyMode::Buffered);
        flow.set_body(Bytes::from_static(b"replaced"));
        assert_eq!(flow.body().await.unwrap().unwrap(), "replaced");
        assert!(flow.has_chunks());
    }

    #[tokio::test]
    async fn test_buffered_collects_source() {
        let mut flow = BufferFlow::new(Some(source(&["hel", "lo"])), BodyMode::Buffered);
        assert_eq!(flow.body().await.unwrap().unwrap(), "hello");
        // second read returns the materialized copy
        assert_eq!(flow.body().await.unwrap().unwrap(), "hello");

        let chunks = drain(flow.chunks().await.unwrap()).await;
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        assert_eq!(flow.materialized_len(), Some(5));
    }

    #[tokio::test]
    async fn test_streaming_ignores_body_operations() {
        let mut flow = BufferFlow::new(Some(source(&["x", "y", "z"])), BodyMode::Streaming);

        flow.set_body(Bytes::from_static(b"ignored"));
        assert!(flow.body().await.unwrap().is_none());
        assert!(flow.body_or_empty().await.unwrap().is_empty());

        let mut called = false;
        flow.on_body(|b| {
            called = true;
            async move { Ok(b) }
        })
        .await
        .unwrap();
        assert!(!called);

        let chunks = drain(flow.chunks().await.unwrap()).await;
        assert_eq!(chunks, vec!["x", "y", "z"]);
    }

    #[tokio::test]
    async fn test_on_body_receives_empty_when_absent() {
        let mut flow = BufferFlow::empty(BodyMode::Buffered);
        assert!(!flow.has_chunks());

        flow.on_body(|b| async move {
            assert!(b.is_empty());
            Ok(Bytes::from_static(b"created"))
        })
        .await
        .unwrap();

        assert_eq!(flow.body().await.unwrap().unwrap(), "created");
        assert!(flow.has_chunks());
    }

    #[tokio::test]
    async fn test_on_body_transforms() {
        let mut flow = BufferFlow::new(Some(source(&["abc"])), BodyMode::Buffered);
        flow.on_body(|b| async move { Ok(Bytes::from(b.to_ascii_uppercase())) })
            .await
            .unwrap();
        assert_eq!(flow.body_or_empty().await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn test_on_body_result_seen_by_body_and_chunks() {
        let mut flow = BufferFlow::new(Some(source(&["init"])), BodyMode::Buffered);
        flow.on_body(|_| async move { Ok(Bytes::from_static(b"mapped")) })
            .await
            .unwrap();

        assert_eq!(flow.body().await.unwrap().unwrap(), "mapped");
        let chunks = drain(flow.chunks().await.unwrap()).await;
        assert_eq!(chunks, vec![Bytes::from_static(b"mapped")]);
    }

    #[tokio::test]
    async fn test_limit_enforced_when_collecting() {
        let mut flow =
            BufferFlow::new(Some(source(&["1234", "5678"])), BodyMode::Buffered).with_limit(6);
        let err = flow.body().await.unwrap_err();
        assert!(matches!(err, GatewayError::BodyTooLarge { limit: 6 }));
    }

    #[tokio::test]
    async fn test_map_chunks_only_when_streaming() {
        let mut flow = BufferFlow::new(Some(source(&["a", "b"])), BodyMode::Streaming);
        flow.map_chunks(|s| {
            s.filter(|chunk| {
                let keep = chunk.as_ref().map(|b| b != "a").unwrap_or(true);
                futures::future::ready(keep)
            })
            .boxed()
        });
        assert_eq!(drain(flow.chunks().await.unwrap()).await, vec!["b"]);
    }

    #[test]
    fn test_mode_resolution() {
        assert_eq!(
            BodyMode::resolve(BodyModeSetting::Auto, Some("application/json"), false),
            BodyMode::Streaming
        );
        assert_eq!(
            BodyMode::resolve(BodyModeSetting::Auto, Some("application/json"), true),
            BodyMode::Buffered
        );
        assert_eq!(
            BodyMode::resolve(BodyModeSetting::Buffered, Some("text/event-stream"), true),
            BodyMode::Streaming
        );
        assert_eq!(
            BodyMode::resolve(BodyModeSetting::Buffered, None, false),
            BodyMode::Buffered
        );
    }
}
