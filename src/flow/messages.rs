//! Message-level filtering of newline-delimited bodies.
//!
//! Each line of the body is one [`Message`]; a line is kept when the step's
//! condition holds for it. Streamed bodies are split on line boundaries across
//! chunks and filtered as they flow; a pending line longer than the body limit
//! fails the stream with `BodyTooLarge`.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::core::error::GatewayError;
use crate::core::types::Message;
use crate::flow::condition::{ConditionFilter, ConditionScope, Conditional};
use crate::proxy::body::ChunkStream;

/// Scope combining the request variables with one message
pub struct MessageScope<'a> {
    base: &'a Value,
    message: &'a Message,
}

impl<'a> MessageScope<'a> {
    pub fn new(base: &'a Value, message: &'a Message) -> Self {
        Self { base, message }
    }
}

impl ConditionScope for MessageScope<'_> {
    fn variables(&self) -> Value {
        let mut variables = self.base.clone();
        if let Value::Object(ref mut map) = variables {
            map.insert(
                "message".to_string(),
                json!({
                    "id": self.message.id,
                    "content": String::from_utf8_lossy(&self.message.content),
                    "json": self.message.json(),
                    "headers": self.message.headers,
                    "attributes": self.message.attributes,
                }),
            );
        }
        variables
    }
}

/// A message paired with the condition it must satisfy
struct MessageCandidate {
    condition: Arc<str>,
}

impl Conditional for MessageCandidate {
    fn condition(&self) -> Option<&str> {
        Some(&self.condition)
    }

    fn label(&self) -> &str {
        "message"
    }
}

/// Shared state for filtering one body
#[derive(Clone)]
pub struct MessageFilter {
    filter: ConditionFilter,
    condition: Arc<str>,
    base: Arc<Value>,
}

impl MessageFilter {
    pub fn new(filter: ConditionFilter, condition: &str, base: Value) -> Self {
        Self {
            filter,
            condition: Arc::from(condition),
            base: Arc::new(base),
        }
    }

    /// Whether a single line passes; blank lines always do
    pub async fn accepts(&self, line: &[u8]) -> bool {
        let content = trim_line(line);
        if content.is_empty() {
            return true;
        }
        let message = Message::new(Bytes::copy_from_slice(content));
        let scope = MessageScope::new(&self.base, &message);
        let candidate = MessageCandidate {
            condition: self.condition.clone(),
        };
        let kept = self.filter.filter(&scope, candidate).await.is_some();
        if !kept {
            metrics::counter!("gateway_messages_filtered_total").increment(1);
        }
        kept
    }

    /// Filter a materialized body line by line
    pub async fn filter_buffer(&self, body: Bytes) -> Bytes {
        let mut out = BytesMut::with_capacity(body.len());
        for line in body.split_inclusive(|b| *b == b'\n') {
            if self.accepts(line).await {
                out.extend_from_slice(line);
            }
        }
        out.freeze()
    }

    /// Filter a live stream, re-chunking it on line boundaries
    pub fn filter_stream(self, chunks: ChunkStream, limit: Option<usize>) -> ChunkStream {
        lines(chunks, limit)
            .filter_map(move |item| {
                let this = self.clone();
                async move {
                    match item {
                        Ok(line) => this.accepts(&line).await.then_some(Ok(line)),
                        Err(e) => Some(Err(e)),
                    }
                }
            })
            .boxed()
    }
}

struct LineState {
    inner: ChunkStream,
    buffer: BytesMut,
    limit: Option<usize>,
    done: bool,
}

/// Split a chunk stream into lines, each keeping its trailing newline
fn lines(chunks: ChunkStream, limit: Option<usize>) -> ChunkStream {
    let state = LineState {
        inner: chunks,
        buffer: BytesMut::new(),
        limit,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line = state.buffer.split_to(pos + 1).freeze();
                return Some((Ok(line), state));
            }
            if state.done {
                if state.buffer.is_empty() {
                    return None;
                }
                let rest = state.buffer.split().freeze();
                return Some((Ok(rest), state));
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    if let Some(limit) = state.limit {
                        // bytes after the last newline are the unterminated line
                        let pending = state.buffer.len()
                            - state
                                .buffer
                                .iter()
                                .rposition(|b| *b == b'\n')
                                .map_or(0, |pos| pos + 1);
                        if pending > limit {
                            state.done = true;
                            state.buffer.clear();
                            return Some((Err(GatewayError::BodyTooLarge { limit }), state));
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(e), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
