//! # Execution Context
//!
//! Per-request state shared by processors, flows and the backend invoker. The
//! context owns both bodies so a flow can rewrite them in place.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::core::types::{IncomingRequest, OutgoingResponse};
use crate::proxy::body::{BodyMode, BufferFlow};

/// Attribute a flow can set to route the request to another endpoint group
pub const ATTR_ENDPOINT_GROUP: &str = "gateway.endpoint-group";

/// State of one request as it moves through the reactor
#[derive(Debug)]
pub struct ExecutionContext {
    pub request: IncomingRequest,

    pub response: OutgoingResponse,

    /// Free-form values set by flows and visible to conditions
    pub attributes: HashMap<String, Value>,

    pub request_body: BufferFlow,

    pub response_body: BufferFlow,

    pub api_id: Option<String>,

    /// Plan selected for the request, if the API declares any
    pub plan: Option<String>,

    /// Endpoint the request was sent to
    pub endpoint: Option<String>,
}

impl ExecutionContext {
    pub fn new(request: IncomingRequest, request_body: BufferFlow) -> Self {
        Self {
            request,
            response: OutgoingResponse::default(),
            attributes: HashMap::new(),
            request_body,
            response_body: BufferFlow::empty(BodyMode::Buffered),
            api_id: None,
            plan: None,
            endpoint: None,
        }
    }

    /// Endpoint group requested through the context attributes
    pub fn requested_group(&self) -> Option<&str> {
        self.attributes
            .get(ATTR_ENDPOINT_GROUP)
            .and_then(|v| v.as_str())
    }

    /// Snapshot of the variables visible to condition expressions
    ///
    /// Header names are lowercased and only their first value is kept.
    pub fn template_variables(&self) -> Value {
        let request = &self.request;

        let mut headers = Map::new();
        for (name, value) in request.headers.iter() {
            if headers.contains_key(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }

        let mut response_headers = Map::new();
        for (name, value) in self.response.headers.iter() {
            if let Ok(value) = value.to_str() {
                response_headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| Value::String(value.to_string()));
            }
        }

        json!({
            "request": {
                "id": request.id,
                "method": request.method.as_str(),
                "path": request.path_info,
                "uri": request.uri.to_string(),
                "version": format!("{:?}", request.version),
                "headers": headers,
                "params": request.path_params,
                "query": request.query_params(),
                "remote_addr": request.remote_addr.map(|a| a.ip().to_string()),
            },
            "response": {
                "status": self.response.status.as_u16(),
                "headers": response_headers,
            },
            "context": {
                "api": self.api_id,
                "plan": self.plan,
                "attributes": self.attributes,
            },
        })
    }
}
