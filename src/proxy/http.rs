//! HTTP backend connections over `reqwest`.
//!
//! The request is sent from a spawned task as soon as the connection is
//! opened; body chunks written to the connection flow to it through a bounded
//! channel. Dropping the connection aborts the exchange.

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::proxy::body::ChunkStream;
use crate::proxy::connection::{
    BodyHandler, EndHandler, ProxyConnection, ProxyResponse, ResponseHandler,
};

const BODY_CHANNEL_CAPACITY: usize = 16;

/// Headers meaningful for a single hop only
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including those listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Backend URL for a request: target base, then the path below the context
/// path, then the original query string
pub fn upstream_url(target: &Url, path_info: &str, query: Option<&str>) -> GatewayResult<Url> {
    let base = target.as_str().trim_end_matches('/');
    let mut url = format!("{}{}", base, path_info);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    Url::parse(&url).map_err(|e| GatewayError::internal(format!("invalid upstream url '{}': {}", url, e)))
}

/// Live connection to an HTTP backend
pub struct HttpProxyConnection {
    target: String,
    body: Option<mpsc::Sender<Result<Bytes, std::io::Error>>>,
    response: Option<oneshot::Receiver<GatewayResult<Box<dyn ProxyResponse>>>>,
    exchange: JoinHandle<()>,
}

impl HttpProxyConnection {
    /// Open the exchange; `with_body` decides whether a body will be written
    pub fn connect(
        client: &reqwest::Client,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        with_body: bool,
    ) -> Self {
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let target = url.origin().ascii_serialization();
        let mut request = client.request(method, url).headers(headers);

        let body = if with_body {
            let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
            request = request.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));
            Some(tx)
        } else {
            None
        };

        let (response_tx, response_rx) = oneshot::channel();
        let backend = target.clone();
        let exchange = tokio::spawn(async move {
            let started = Instant::now();
            let result = match request.send().await {
                Ok(response) => {
                    metrics::histogram!("gateway_upstream_duration_seconds", "backend" => backend.clone())
                        .record(started.elapsed().as_secs_f64());
                    debug!(backend = %backend, status = response.status().as_u16(), "Backend responded");
                    Ok(Box::new(HttpProxyResponse::new(response)) as Box<dyn ProxyResponse>)
                }
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Backend request failed");
                    metrics::counter!("gateway_upstream_errors_total", "backend" => backend.clone())
                        .increment(1);
                    Err(GatewayError::from(e))
                }
            };
            let _ = response_tx.send(result);
        });

        Self {
            target,
            body,
            response: Some(response_rx),
            exchange,
        }
    }
}

#[async_trait]
impl ProxyConnection for HttpProxyConnection {
    async fn write(&mut self, chunk: Bytes) -> GatewayResult<()> {
        let sender = self.body.as_ref().ok_or_else(|| {
            GatewayError::protocol_misuse("request body written after end or without a body")
        })?;
        sender.send(Ok(chunk)).await.map_err(|_| {
            GatewayError::service_unavailable(&self.target, "backend closed the request body")
        })
    }

    async fn end(&mut self) {
        self.body.take();
    }

    fn response_handler(&mut self, handler: ResponseHandler) {
        let Some(response) = self.response.take() else {
            warn!(backend = %self.target, "Response handler registered twice");
            return;
        };
        let target = self.target.clone();
        tokio::spawn(async move {
            let result = response.await.unwrap_or_else(|_| {
                Err(GatewayError::service_unavailable(target, "backend exchange aborted"))
            });
            handler(result);
        });
    }
}

impl Drop for HttpProxyConnection {
    fn drop(&mut self) {
        self.exchange.abort();
    }
}

/// Response received from an HTTP backend
pub struct HttpProxyResponse {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Option<ChunkStream>,
    body_handler: Option<BodyHandler>,
    end_handler: Option<EndHandler>,
}

impl HttpProxyResponse {
    pub fn new(response: reqwest::Response) -> Self {
        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from))
            .boxed();
        Self {
            status,
            headers,
            chunks: Some(chunks),
            body_handler: None,
            end_handler: None,
        }
    }
}

impl ProxyResponse for HttpProxyResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn connected(&self) -> bool {
        true
    }

    fn body_handler(&mut self, handler: BodyHandler) {
        self.body_handler = Some(handler);
    }

    fn end_handler(&mut self, handler: EndHandler) {
        self.end_handler = Some(handler);
    }

    fn resume(&mut self) {
        let chunks = self.chunks.take();
        let mut on_chunk = self.body_handler.take();
        let on_end = self.end_handler.take();
        tokio::spawn(async move {
            if let Some(mut chunks) = chunks {
                while let Some(chunk) = chunks.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if let Some(ref mut handler) = on_chunk {
                                handler(chunk);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Backend body failed");
                            break;
                        }
                    }
                }
            }
            if let Some(end) = on_end {
                end();
            }
        });
    }

    fn into_chunks(mut self: Box<Self>) -> ChunkStream {
        self.chunks.take().unwrap_or_else(|| stream::empty().boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_upstream_url() {
        let target = Url::parse("http://backend:8080/v1/").unwrap();
        let url = upstream_url(&target, "/orders/7", Some("expand=items")).unwrap();
        assert_eq!(url.as_str(), "http://backend:8080/v1/orders/7?expand=items");

        let root = Url::parse("http://backend:8080").unwrap();
        let url = upstream_url(&root, "/", None).unwrap();
        assert_eq!(url.as_str(), "http://backend:8080/");
    }
}
