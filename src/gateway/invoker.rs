//! # Backend Invoker
//!
//! Sends the request to an endpoint of the API and attaches the backend
//! response to the execution context.
//!
//! The endpoint group comes from the `gateway.endpoint-group` attribute when a
//! flow set it, else the API default group. Mock endpoints answer through a
//! [`SyntheticConnection`] and never touch the network.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::context::ExecutionContext;
use crate::core::definition::MockDefinition;
use crate::core::error::{GatewayError, GatewayResult};
use crate::flow::chain::Phase;
use crate::gateway::registry::DeployedApi;
use crate::load_balancing::group::{Endpoint, EndpointTarget};
use crate::proxy::body::{BodyMode, BufferFlow};
use crate::proxy::connection::{
    ProxyConnection, ProxyResponse, ResponseHandler, SyntheticConnection, SyntheticResponse,
};
use crate::proxy::http::{upstream_url, HttpProxyConnection};

type PendingResponse = oneshot::Receiver<GatewayResult<Box<dyn ProxyResponse>>>;

/// Invokes backend endpoints
pub struct Invoker {
    client: reqwest::Client,
    max_body_size: usize,
}

impl Invoker {
    pub fn new(max_body_size: usize, connect_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            max_body_size,
        })
    }

    /// Select an endpoint, send the request and attach the response
    pub async fn invoke(&self, ctx: &mut ExecutionContext, api: &DeployedApi) -> GatewayResult<()> {
        let group = api.endpoints.resolve(ctx.requested_group())?;
        let endpoint = group
            .next()
            .ok_or_else(|| GatewayError::no_endpoint(group.name()))?;
        ctx.endpoint = Some(endpoint.name.clone());

        debug!(
            request_id = %ctx.request.id,
            group = %group.name(),
            endpoint = %endpoint.name,
            "Invoking endpoint"
        );

        let response = match endpoint.target {
            EndpointTarget::Mock(ref mock) => self.invoke_mock(mock).await?,
            EndpointTarget::Http(_) => self.invoke_http(ctx, &endpoint).await?,
        };

        if !response.connected() {
            debug!(request_id = %ctx.request.id, endpoint = %endpoint.name, "Synthetic response");
        }

        ctx.response.status = response.status();
        let gateway_headers = std::mem::replace(&mut ctx.response.headers, response.headers().clone());
        for (name, value) in gateway_headers.iter() {
            if !ctx.response.headers.contains_key(name) {
                ctx.response.headers.insert(name.clone(), value.clone());
            }
        }

        let mode = BodyMode::resolve(
            api.definition.body_mode,
            ctx.response.content_type(),
            api.needs_body(Phase::Response),
        );
        ctx.response_body =
            BufferFlow::new(Some(response.into_chunks()), mode).with_limit(self.max_body_size);
        Ok(())
    }

    async fn invoke_mock(&self, mock: &MockDefinition) -> GatewayResult<Box<dyn ProxyResponse>> {
        let (handler, pending) = bridge();
        let mut connection = SyntheticConnection::new(mock_response(mock)?);
        connection.response_handler(handler);
        connection.end().await;
        connection.send_response();
        receive(pending).await
    }

    async fn invoke_http(
        &self,
        ctx: &mut ExecutionContext,
        endpoint: &Arc<Endpoint>,
    ) -> GatewayResult<Box<dyn ProxyResponse>> {
        let EndpointTarget::Http(ref target) = endpoint.target else {
            return Err(GatewayError::internal("endpoint has no HTTP target"));
        };
        let url = upstream_url(target, &ctx.request.path_info, ctx.request.query())?;
        let with_body = ctx.request_body.has_chunks();

        let (handler, pending) = bridge();
        let mut connection = HttpProxyConnection::connect(
            &self.client,
            ctx.request.method.clone(),
            url,
            ctx.request.headers.clone(),
            with_body,
        );
        connection.response_handler(handler);

        if with_body {
            let mut chunks = ctx.request_body.chunks().await?;
            while let Some(chunk) = chunks.next().await {
                if let Err(e) = connection.write(chunk?).await {
                    warn!(endpoint = %endpoint.name, error = %e, "Request body not fully sent");
                    break;
                }
            }
        }
        connection.end().await;

        // the connection must outlive the exchange
        let response = receive(pending).await;
        drop(connection);
        response
    }
}

fn bridge() -> (ResponseHandler, PendingResponse) {
    let (tx, rx) = oneshot::channel();
    let handler: ResponseHandler = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (handler, rx)
}

async fn receive(pending: PendingResponse) -> GatewayResult<Box<dyn ProxyResponse>> {
    pending
        .await
        .map_err(|_| GatewayError::internal("response handler dropped without a response"))?
}

fn mock_response(mock: &MockDefinition) -> GatewayResult<SyntheticResponse> {
    let status = StatusCode::from_u16(mock.status)
        .map_err(|_| GatewayError::config(format!("invalid mock status {}", mock.status)))?;
    let mut headers = HeaderMap::new();
    for (name, value) in &mock.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::config(format!("invalid mock header '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::config(format!("invalid mock header value: {}", e)))?;
        headers.insert(name, value);
    }
    Ok(SyntheticResponse::with_headers(status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::definition::ApiDefinition;
    use crate::core::types::IncomingRequest;
    use crate::flow::expression::TeraEngine;
    use axum::http::{Method, Version};

    fn deployed(yaml: &str) -> DeployedApi {
        let definition: ApiDefinition = serde_yaml::from_str(yaml).unwrap();
        DeployedApi::compile(&definition, &[], &TeraEngine::new()).unwrap()
    }

    fn context() -> ExecutionContext {
        let request = IncomingRequest::new(
            Method::GET,
            "/mock/items".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        ExecutionContext::new(request, BufferFlow::empty(BodyMode::Buffered))
    }

    const MOCK_API: &str = r#"
id: mock
context_path: /mock
endpoint_groups:
  - name: default
    endpoints:
      - name: stub
        mock:
          status: 418
          headers:
            x-mock: "yes"
  - name: empty
    endpoints: []
"#;

    #[tokio::test]
    async fn test_mock_endpoint() {
        let api = deployed(MOCK_API);
        let invoker = Invoker::new(1024, Duration::from_secs(1)).unwrap();
        let mut ctx = context();

        invoker.invoke(&mut ctx, &api).await.unwrap();
        assert_eq!(ctx.response.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(ctx.response.header("x-mock"), Some("yes"));
        assert_eq!(ctx.response.header("connection"), Some("close"));
        assert_eq!(ctx.endpoint.as_deref(), Some("stub"));
        assert_eq!(ctx.response_body.body_or_empty().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_empty_group_is_unavailable() {
        let api = deployed(MOCK_API);
        let invoker = Invoker::new(1024, Duration::from_secs(1)).unwrap();
        let mut ctx = context();
        ctx.attributes.insert(
            crate::core::context::ATTR_ENDPOINT_GROUP.to_string(),
            serde_json::json!("empty"),
        );

        let err = invoker.invoke(&mut ctx, &api).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unknown_group_is_unavailable() {
        let api = deployed(MOCK_API);
        let invoker = Invoker::new(1024, Duration::from_secs(1)).unwrap();
        let mut ctx = context();
        ctx.attributes.insert(
            crate::core::context::ATTR_ENDPOINT_GROUP.to_string(),
            serde_json::json!("ghost"),
        );

        let err = invoker.invoke(&mut ctx, &api).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoEndpoint { .. }));
    }
}
