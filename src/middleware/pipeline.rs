//! # Processor Pipeline
//!
//! Processors run around the flow phases of every request: pre-processors
//! before the platform request flows, post-processors once the response is
//! final. Unlike flows they are not configurable per API and always apply.
//!
//! ## Rust Concepts Used
//! - `async_trait` for async trait methods
//! - `Arc<dyn Processor>` so one processor instance serves every request

use async_trait::async_trait;
use axum::http::HeaderValue;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::context::ExecutionContext;
use crate::core::error::GatewayResult;
use crate::core::types::TRANSACTION_ID_HEADER;

/// A processor hooked before or after the flow phases
#[async_trait]
pub trait Processor: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Called before any request flow runs
    async fn on_request(&self, _ctx: &mut ExecutionContext) -> GatewayResult<()> {
        Ok(())
    }

    /// Called once the response headers are final
    async fn on_response(&self, _ctx: &mut ExecutionContext) -> GatewayResult<()> {
        Ok(())
    }
}

/// Ordered pre- and post-processors
#[derive(Debug, Clone, Default)]
pub struct ProcessorChain {
    pre: Vec<Arc<dyn Processor>>,
    post: Vec<Arc<dyn Processor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre(mut self, processor: Arc<dyn Processor>) -> Self {
        self.pre.push(processor);
        self
    }

    pub fn with_post(mut self, processor: Arc<dyn Processor>) -> Self {
        self.post.push(processor);
        self
    }

    /// Run the pre-processors; the first error stops the chain
    pub async fn pre_process(&self, ctx: &mut ExecutionContext) -> GatewayResult<()> {
        for processor in &self.pre {
            debug!(processor = processor.name(), "Running pre-processor");
            processor.on_request(ctx).await?;
        }
        Ok(())
    }

    /// Run every post-processor, logging failures instead of stopping
    pub async fn post_process(&self, ctx: &mut ExecutionContext) {
        for processor in &self.post {
            debug!(processor = processor.name(), "Running post-processor");
            if let Err(e) = processor.on_response(ctx).await {
                warn!(processor = processor.name(), error = %e, "Post-processor failed");
            }
        }
    }
}

/// Propagates or generates the transaction id and echoes it on the response
#[derive(Debug, Default)]
pub struct TransactionIdProcessor;

#[async_trait]
impl Processor for TransactionIdProcessor {
    fn name(&self) -> &str {
        "transaction-id"
    }

    async fn on_request(&self, ctx: &mut ExecutionContext) -> GatewayResult<()> {
        let existing = ctx
            .request
            .header(TRANSACTION_ID_HEADER)
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string);
        let transaction_id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Ok(value) = HeaderValue::from_str(&transaction_id) {
            ctx.request.headers.insert(TRANSACTION_ID_HEADER, value.clone());
            ctx.response.headers.insert(TRANSACTION_ID_HEADER, value);
        }
        ctx.attributes.insert(
            "transaction-id".to_string(),
            serde_json::Value::String(transaction_id),
        );
        Ok(())
    }

    async fn on_response(&self, ctx: &mut ExecutionContext) -> GatewayResult<()> {
        if let Some(value) = ctx.request.headers.get(TRANSACTION_ID_HEADER).cloned() {
            ctx.response.headers.insert(TRANSACTION_ID_HEADER, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayError;
    use crate::core::types::IncomingRequest;
    use crate::proxy::body::{BodyMode, BufferFlow};
    use axum::http::{HeaderMap, Method, Version};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(headers: HeaderMap) -> ExecutionContext {
        let request = IncomingRequest::new(
            Method::GET,
            "/orders".parse().unwrap(),
            Version::HTTP_11,
            headers,
        );
        ExecutionContext::new(request, BufferFlow::empty(BodyMode::Buffered))
    }

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_request(&self, _ctx: &mut ExecutionContext) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GatewayError::internal("boom"));
            }
            Ok(())
        }

        async fn on_response(&self, _ctx: &mut ExecutionContext) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::internal("ignored"))
        }
    }

    #[tokio::test]
    async fn test_transaction_id_generated() {
        let mut ctx = context(HeaderMap::new());
        TransactionIdProcessor.on_request(&mut ctx).await.unwrap();

        let id = ctx.request.header(TRANSACTION_ID_HEADER).unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(ctx.response.header(TRANSACTION_ID_HEADER), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_transaction_id_propagated() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSACTION_ID_HEADER, HeaderValue::from_static("tx-42"));
        let mut ctx = context(headers);

        TransactionIdProcessor.on_request(&mut ctx).await.unwrap();
        ctx.response.headers.clear();
        TransactionIdProcessor.on_response(&mut ctx).await.unwrap();

        assert_eq!(ctx.response.header(TRANSACTION_ID_HEADER), Some("tx-42"));
    }

    #[tokio::test]
    async fn test_pre_process_stops_on_error() {
        let failing = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let after = Arc::new(Counting::default());
        let chain = ProcessorChain::new()
            .with_pre(failing.clone())
            .with_pre(after.clone());

        let mut ctx = context(HeaderMap::new());
        assert!(chain.pre_process(&mut ctx).await.is_err());
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_post_process_runs_all() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let chain = ProcessorChain::new()
            .with_post(first.clone())
            .with_post(second.clone());

        let mut ctx = context(HeaderMap::new());
        chain.post_process(&mut ctx).await;
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }
}
