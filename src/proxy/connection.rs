//! # Proxy Connections
//!
//! A [`ProxyConnection`] is the request side of one backend exchange: the
//! invoker writes the request body into it, ends it, and receives the
//! backend's [`ProxyResponse`] through the registered response handler.
//!
//! [`SyntheticConnection`] stands in for a backend when the gateway answers on
//! its own (mock endpoints, locally generated results). It never accepts a
//! body and its response is prebuilt, marked as not connected and always
//! closes the client connection.

use async_trait::async_trait;
use axum::http::{header::CONNECTION, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::{debug, error};

use crate::core::error::{GatewayError, GatewayResult};
use crate::proxy::body::ChunkStream;

/// Callback receiving the backend response, or the reason there is none
pub type ResponseHandler = Box<dyn FnOnce(GatewayResult<Box<dyn ProxyResponse>>) + Send>;

/// Callback receiving each body chunk pushed by [`ProxyResponse::resume`]
pub type BodyHandler = Box<dyn FnMut(Bytes) + Send>;

/// Callback run once the response body is complete
pub type EndHandler = Box<dyn FnOnce() + Send>;

/// Request side of a backend exchange
#[async_trait]
pub trait ProxyConnection: Send {
    /// Forward one chunk of the request body
    async fn write(&mut self, chunk: Bytes) -> GatewayResult<()>;

    /// Signal that the request body is complete
    async fn end(&mut self);

    /// Register the callback invoked when the response is available
    fn response_handler(&mut self, handler: ResponseHandler);
}

/// Response side of a backend exchange
pub trait ProxyResponse: Send {
    fn status(&self) -> StatusCode;

    fn headers(&self) -> &HeaderMap;

    /// `false` for responses that never touched a backend socket
    fn connected(&self) -> bool;

    fn body_handler(&mut self, handler: BodyHandler);

    fn end_handler(&mut self, handler: EndHandler);

    /// Start pushing the body to the body handler, then call the end handler
    fn resume(&mut self);

    /// Take the body as a chunk stream instead of handlers
    fn into_chunks(self: Box<Self>) -> ChunkStream;
}

/// Prebuilt response of a [`SyntheticConnection`]
pub struct SyntheticResponse {
    status: StatusCode,
    headers: HeaderMap,
    body_handler: Option<BodyHandler>,
    end_handler: Option<EndHandler>,
}

impl SyntheticResponse {
    pub fn new(status: StatusCode) -> Self {
        Self::with_headers(status, HeaderMap::new())
    }

    pub fn with_headers(status: StatusCode, mut headers: HeaderMap) -> Self {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        Self {
            status,
            headers,
            body_handler: None,
            end_handler: None,
        }
    }
}

impl ProxyResponse for SyntheticResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn connected(&self) -> bool {
        false
    }

    fn body_handler(&mut self, handler: BodyHandler) {
        self.body_handler = Some(handler);
    }

    fn end_handler(&mut self, handler: EndHandler) {
        self.end_handler = Some(handler);
    }

    fn resume(&mut self) {
        // no body to push
        if let Some(end) = self.end_handler.take() {
            end();
        }
    }

    fn into_chunks(self: Box<Self>) -> ChunkStream {
        stream::empty().boxed()
    }
}

/// Connection answering with a prebuilt response, never reaching a backend
pub struct SyntheticConnection {
    response: Option<SyntheticResponse>,
    handler: Option<ResponseHandler>,
}

impl SyntheticConnection {
    pub fn new(response: SyntheticResponse) -> Self {
        Self {
            response: Some(response),
            handler: None,
        }
    }

    /// Hand the prebuilt response to the registered handler
    ///
    /// Does nothing when no handler is registered yet or the response was
    /// already delivered.
    pub fn send_response(&mut self) {
        match (self.handler.take(), self.response.take()) {
            (Some(handler), Some(response)) => handler(Ok(Box::new(response))),
            (handler, response) => {
                debug!("Synthetic response not delivered: handler or response missing");
                self.handler = handler;
                self.response = response;
            }
        }
    }
}

#[async_trait]
impl ProxyConnection for SyntheticConnection {
    async fn write(&mut self, _chunk: Bytes) -> GatewayResult<()> {
        error!("Attempted to write a request body to a synthetic connection");
        Err(GatewayError::protocol_misuse(
            "synthetic connection does not accept a request body",
        ))
    }

    async fn end(&mut self) {}

    fn response_handler(&mut self, handler: ResponseHandler) {
        self.handler = Some(handler);
    }
}
