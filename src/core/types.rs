//! # Core Types Module
//!
//! Request, response and message types that flow through the reactor.
//!
//! - [`IncomingRequest`] is the request metadata; request flows may rewrite headers
//! - [`OutgoingResponse`] is the response metadata; bodies live in `BufferFlow`
//! - [`Message`] is one unit of a message stream, filtered by message conditions

use axum::http::{HeaderMap, Method, StatusCode, Uri, Version};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Header carrying the transaction id across the gateway
pub const TRANSACTION_ID_HEADER: &str = "x-transaction-id";

/// Represents an incoming request once accepted by the server
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (for tracing and logging)
    pub id: String,

    pub method: Method,

    /// Request URI including path and query parameters
    pub uri: Uri,

    /// HTTP version (1.0, 1.1, 2.0)
    pub version: Version,

    /// Request headers, mutable by request flows
    pub headers: HeaderMap,

    /// Client's remote address when known
    pub remote_addr: Option<SocketAddr>,

    /// Timestamp when the request was received
    pub received_at: Instant,

    /// Path relative to the API context path, set once the API is resolved
    pub path_info: String,

    /// Parameters captured by a template selector
    pub path_params: HashMap<String, String>,
}

impl IncomingRequest {
    /// Create a new incoming request with a generated ID
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap) -> Self {
        let path_info = uri.path().to_string();
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            version,
            headers,
            remote_addr: None,
            received_at: Instant::now(),
            path_info,
            path_params: HashMap::new(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get query parameters as a string
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Decoded query parameters; the first occurrence of a key wins
    pub fn query_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let Some(query) = self.query() else {
            return params;
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key);
            let value = decode_component(value);
            params.entry(key).or_insert(value);
        }
        params
    }

    /// Content type of the request, without parameters
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .unwrap_or(raw)
}

/// Response metadata being built for the client
#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl Default for OutgoingResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        }
    }
}

impl OutgoingResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }
}

/// One message of a message stream
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,

    #[serde(serialize_with = "serialize_content")]
    pub content: Bytes,

    pub headers: HashMap<String, String>,

    pub attributes: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(content: Bytes) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content,
            headers: HashMap::new(),
            attributes: HashMap::new(),
        }
    }

    /// Content parsed as JSON, when it is JSON
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.content).ok()
    }
}

fn serialize_content<S: serde::Serializer>(content: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(content))
}
