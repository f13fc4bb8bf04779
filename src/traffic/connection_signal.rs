//! Connection draining signal on outbound responses.
//!
//! Once the node leaves `STARTED`, every finalized response tells the client
//! to stop reusing its connection: `Connection: close` for HTTP/1.x and
//! `Connection: go_away` for HTTP/2. Connection headers are illegal on HTTP/2
//! streams, so the server strips the marker before sending; the GOAWAY frame
//! itself comes from the listener's graceful shutdown, which starts as soon as
//! the node enters `STOPPING`.

use async_trait::async_trait;
use axum::http::{header::CONNECTION, HeaderValue, Version};
use tracing::debug;

use super::shutdown::{NodeLifecycle, NodeState};
use crate::core::context::ExecutionContext;
use crate::core::error::GatewayResult;
use crate::middleware::pipeline::Processor;

pub const CONNECTION_CLOSE: &str = "close";
pub const CONNECTION_GO_AWAY: &str = "go_away";

/// Post-processor writing the drain signal while the node is stopping
#[derive(Debug, Clone)]
pub struct ShutdownSignalInjector {
    lifecycle: NodeLifecycle,
}

impl ShutdownSignalInjector {
    pub fn new(lifecycle: NodeLifecycle) -> Self {
        Self { lifecycle }
    }

    /// Connection header value for a request version, if any applies
    pub fn signal_for(version: Version) -> Option<&'static str> {
        match version {
            Version::HTTP_2 => Some(CONNECTION_GO_AWAY),
            Version::HTTP_10 | Version::HTTP_11 => Some(CONNECTION_CLOSE),
            _ => None,
        }
    }
}

#[async_trait]
impl Processor for ShutdownSignalInjector {
    fn name(&self) -> &str {
        "shutdown-signal"
    }

    async fn on_response(&self, ctx: &mut ExecutionContext) -> GatewayResult<()> {
        let state = self.lifecycle.state();
        if state == NodeState::Started {
            return Ok(());
        }
        if let Some(signal) = Self::signal_for(ctx.request.version) {
            debug!(request_id = %ctx.request.id, %state, signal, "Signalling connection drain");
            ctx.response
                .headers
                .insert(CONNECTION, HeaderValue::from_static(signal));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IncomingRequest;
    use crate::proxy::body::{BodyMode, BufferFlow};
    use axum::http::{HeaderMap, Method};

    fn context(version: Version) -> ExecutionContext {
        let request = IncomingRequest::new(Method::GET, "/".parse().unwrap(), version, HeaderMap::new());
        ExecutionContext::new(request, BufferFlow::empty(BodyMode::Buffered))
    }

    async fn connection_header(state: NodeState, version: Version) -> Option<String> {
        let lifecycle = NodeLifecycle::new();
        lifecycle.set_state(state);
        let injector = ShutdownSignalInjector::new(lifecycle);
        let mut ctx = context(version);
        injector.on_response(&mut ctx).await.unwrap();
        ctx.response.header("connection").map(str::to_string)
    }

    #[tokio::test]
    async fn test_no_signal_while_started() {
        assert_eq!(connection_header(NodeState::Started, Version::HTTP_11).await, None);
        assert_eq!(connection_header(NodeState::Started, Version::HTTP_2).await, None);
    }

    #[tokio::test]
    async fn test_http2_gets_go_away() {
        assert_eq!(
            connection_header(NodeState::Stopping, Version::HTTP_2).await.as_deref(),
            Some("go_away")
        );
    }

    #[tokio::test]
    async fn test_http1_gets_close() {
        for version in [Version::HTTP_10, Version::HTTP_11] {
            assert_eq!(
                connection_header(NodeState::Stopping, version).await.as_deref(),
                Some("close")
            );
        }
    }

    #[tokio::test]
    async fn test_signal_before_start_and_after_stop() {
        assert_eq!(
            connection_header(NodeState::Starting, Version::HTTP_11).await.as_deref(),
            Some("close")
        );
        assert_eq!(
            connection_header(NodeState::Stopped, Version::HTTP_2).await.as_deref(),
            Some("go_away")
        );
    }

    #[tokio::test]
    async fn test_existing_header_overwritten() {
        let lifecycle = NodeLifecycle::new();
        lifecycle.set_state(NodeState::Stopping);
        let injector = ShutdownSignalInjector::new(lifecycle);
        let mut ctx = context(Version::HTTP_11);
        ctx.response
            .headers
            .insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        injector.on_response(&mut ctx).await.unwrap();
        assert_eq!(ctx.response.header("connection"), Some("close"));
    }
}
