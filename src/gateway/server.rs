//! # HTTP Server Module
//!
//! Binds the gateway listener and hands every request to the [`Reactor`].
//! Request bodies are passed on as chunk streams; response bodies are either
//! sent whole (buffered mode) or streamed back as the backend produces them.
//!
//! `/_node/health` reports the node lifecycle state; everything else belongs
//! to the deployed APIs.

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::{
        header::{CONNECTION, CONTENT_LENGTH},
        HeaderValue, StatusCode, Version,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router as AxumRouter,
};
use futures::{Future, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::IncomingRequest;
use crate::gateway::reactor::{Exchange, Reactor};
use crate::proxy::body::ChunkStream;
use crate::traffic::shutdown::NodeState;

/// Path of the node health endpoint
pub const HEALTH_PATH: &str = "/_node/health";

/// Gateway HTTP server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    app: AxumRouter,
}

impl GatewayServer {
    pub fn new(reactor: Arc<Reactor>, bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            app: router(reactor),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Serve until `shutdown` resolves, then finish open connections
    pub async fn serve<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            GatewayError::internal(format!(
                "Failed to bind gateway server to {}: {}",
                self.bind_addr, e
            ))
        })?;
        info!("Gateway HTTP server listening on {}", self.bind_addr);

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))?;

        info!("Gateway HTTP server stopped");
        Ok(())
    }
}

/// Axum router serving the gateway
pub fn router(reactor: Arc<Reactor>) -> AxumRouter {
    AxumRouter::new()
        .route(HEALTH_PATH, get(node_health))
        .fallback(handle_request)
        .with_state(reactor)
        .layer(TraceLayer::new_for_http())
}

async fn handle_request(State(reactor): State<Arc<Reactor>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let mut incoming = IncomingRequest::new(parts.method, parts.uri, parts.version, parts.headers);
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        incoming = incoming.with_remote_addr(*addr);
    }

    let chunks: Option<ChunkStream> = (!body.is_end_stream()).then(|| {
        body.into_data_stream()
            .map(|chunk| {
                chunk.map_err(|e| GatewayError::Io {
                    message: format!("client body: {}", e),
                })
            })
            .boxed()
    });

    let exchange = reactor.handle(incoming, chunks).await;
    into_response(exchange).await
}

/// Turn a finished exchange into the client response
///
/// The in-flight guard is released once the body has been fully sent.
async fn into_response(exchange: Exchange) -> Response {
    let Exchange { context, guard } = exchange;
    let mut ctx = context;
    let status = ctx.response.status;
    let mut headers = std::mem::take(&mut ctx.response.headers);
    if ctx.request.version == Version::HTTP_2 && headers.remove(CONNECTION).is_some() {
        debug!(request_id = %ctx.request.id, "Dropped connection header on HTTP/2 response");
    }

    let body = if ctx.response_body.is_streaming() {
        match ctx.response_body.chunks().await {
            Ok(chunks) => {
                headers.remove(CONTENT_LENGTH);
                Body::from_stream(chunks.map(move |chunk| {
                    let _held = &guard;
                    chunk
                }))
            }
            Err(e) => return failed(e),
        }
    } else {
        match ctx.response_body.body_or_empty().await {
            Ok(bytes) => {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
                Body::from(bytes)
            }
            Err(e) => return failed(e),
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn failed(error: GatewayError) -> Response {
    warn!(error = %error, "Response body could not be sent");
    error.into_response()
}

async fn node_health(State(reactor): State<Arc<Reactor>>) -> impl IntoResponse {
    let lifecycle = reactor.lifecycle();
    let state = lifecycle.state();
    let status = if state == NodeState::Started {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    debug!(%state, "Health check");

    let body = serde_json::json!({
        "status": state,
        "in_flight": lifecycle.in_flight(),
        "apis": reactor.registry().snapshot().apis().count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (status, Json(body))
}
