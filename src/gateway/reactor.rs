//! # Request Reactor
//!
//! Drives one request through the gateway:
//!
//! 1. resolve the API from the context path (404 when none)
//! 2. pre-processors
//! 3. platform, plan and API request flows
//! 4. backend invocation
//! 5. plan and API response flows
//! 6. platform response flows, which run even after an error or interruption
//! 7. post-processors on the final response
//!
//! Steps 2 to 5 run under the request timeout. Errors become JSON error
//! responses before the platform response flows see them.

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn, Span};

use crate::core::config::GatewayConfig;
use crate::core::context::ExecutionContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{IncomingRequest, TRANSACTION_ID_HEADER};
use crate::flow::chain::{FlowChain, Phase};
use crate::flow::condition::{ConditionFilter, ScopeSnapshot};
use crate::flow::expression::{ExpressionEngine, TeraEngine};
use crate::flow::resolver::{FlowResolver, Plan};
use crate::gateway::invoker::Invoker;
use crate::gateway::registry::{ApiRegistry, DeployedApi, DeploymentReport, RegistrySnapshot};
use crate::middleware::pipeline::{ProcessorChain, TransactionIdProcessor};
use crate::proxy::body::{BodyMode, BufferFlow, ChunkStream};
use crate::traffic::connection_signal::ShutdownSignalInjector;
use crate::traffic::shutdown::{NodeLifecycle, RequestGuard};

/// Reactor settings
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    pub request_timeout: Duration,
    pub max_body_size: usize,
}

/// A handled request: its final context and the in-flight guard
///
/// The guard must live until the response body has been sent.
pub struct Exchange {
    pub context: ExecutionContext,
    pub guard: RequestGuard,
}

/// Handles requests against the current API deployment
pub struct Reactor {
    registry: Arc<ApiRegistry>,
    invoker: Invoker,
    processors: ProcessorChain,
    lifecycle: NodeLifecycle,
    filter: ConditionFilter,
    settings: ReactorSettings,
}

impl Reactor {
    pub fn new(
        registry: Arc<ApiRegistry>,
        invoker: Invoker,
        processors: ProcessorChain,
        lifecycle: NodeLifecycle,
        settings: ReactorSettings,
    ) -> Self {
        let filter = ConditionFilter::expression(registry.engine().clone());
        Self {
            registry,
            invoker,
            processors,
            lifecycle,
            filter,
            settings,
        }
    }

    /// Reactor with the standard processors and the configured APIs deployed
    pub fn from_config(
        config: &GatewayConfig,
        lifecycle: NodeLifecycle,
    ) -> GatewayResult<(Self, DeploymentReport)> {
        let registry = Arc::new(ApiRegistry::new(Arc::new(TeraEngine::new())));
        let report = registry.deploy(&config.platform.flows, &config.apis)?;

        let processors = ProcessorChain::new()
            .with_pre(Arc::new(TransactionIdProcessor))
            .with_post(Arc::new(TransactionIdProcessor))
            .with_post(Arc::new(ShutdownSignalInjector::new(lifecycle.clone())));
        let invoker = Invoker::new(config.server.max_body_size, config.server.request_timeout)?;
        let settings = ReactorSettings {
            request_timeout: config.server.request_timeout,
            max_body_size: config.server.max_body_size,
        };

        Ok((
            Self::new(registry, invoker, processors, lifecycle, settings),
            report,
        ))
    }

    pub fn registry(&self) -> &Arc<ApiRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &NodeLifecycle {
        &self.lifecycle
    }

    fn engine(&self) -> &Arc<dyn ExpressionEngine> {
        self.registry.engine()
    }

    /// Handle one request end to end
    #[instrument(
        skip_all,
        fields(request_id = %request.id, method = %request.method, path = %request.uri.path(), api, status)
    )]
    pub async fn handle(&self, request: IncomingRequest, body: Option<ChunkStream>) -> Exchange {
        let guard = self.lifecycle.track_request();
        let snapshot = self.registry.snapshot();

        let Some((api, path_info)) = snapshot.resolve(request.path()) else {
            let path = request.path().to_string();
            let mut ctx = ExecutionContext::new(request, BufferFlow::empty(BodyMode::Buffered));
            if let Err(e) = self.processors.pre_process(&mut ctx).await {
                warn!(error = %e, "Pre-processing failed");
            }
            apply_error(&mut ctx, &GatewayError::api_not_found(path)).await;
            return self.finish(ctx, None, &snapshot, guard).await;
        };

        let mode = BodyMode::resolve(
            api.definition.body_mode,
            request.content_type(),
            api.needs_body(Phase::Request),
        );
        let mut ctx = ExecutionContext::new(
            request,
            BufferFlow::new(body, mode).with_limit(self.settings.max_body_size),
        );
        ctx.request.path_info = path_info;
        ctx.api_id = Some(api.id().to_string());
        Span::current().record("api", api.id());

        let limit = api
            .definition
            .request_timeout
            .unwrap_or(self.settings.request_timeout);
        let result = match timeout(limit, self.run(&mut ctx, &api, &snapshot)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(api = %api.id(), timeout = ?limit, "Request timed out");
                Err(GatewayError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        };
        if let Err(e) = result {
            apply_error(&mut ctx, &e).await;
        }

        self.finish(ctx, Some(&api), &snapshot, guard).await
    }

    /// Everything between pre-processing and the platform response flows
    async fn run(
        &self,
        ctx: &mut ExecutionContext,
        api: &DeployedApi,
        snapshot: &RegistrySnapshot,
    ) -> GatewayResult<()> {
        self.processors.pre_process(ctx).await?;

        self.chain(snapshot.platform()).execute(ctx, Phase::Request).await?;

        let plan = self.select_plan(ctx, api).await?;
        if let Some(ref plan) = plan {
            self.chain(&plan.resolver).execute(ctx, Phase::Request).await?;
        }
        self.chain(&api.resolver).execute(ctx, Phase::Request).await?;

        self.invoker.invoke(ctx, api).await?;

        if let Some(ref plan) = plan {
            self.chain(&plan.resolver).execute(ctx, Phase::Response).await?;
        }
        self.chain(&api.resolver).execute(ctx, Phase::Response).await?;
        Ok(())
    }

    /// First plan whose selection rule holds; 401 when the API has plans but
    /// none applies
    async fn select_plan(
        &self,
        ctx: &mut ExecutionContext,
        api: &DeployedApi,
    ) -> GatewayResult<Option<Arc<Plan>>> {
        if api.plans.is_empty() {
            return Ok(None);
        }
        let snapshot = ScopeSnapshot(ctx.template_variables());
        for plan in &api.plans {
            if let Some(plan) = self.filter.filter(&snapshot, plan.clone()).await {
                debug!(plan = %plan.name, "Plan selected");
                ctx.plan = Some(plan.name.clone());
                return Ok(Some(plan));
            }
        }
        Err(GatewayError::unauthorized("no plan applies to the request"))
    }

    async fn finish(
        &self,
        mut ctx: ExecutionContext,
        api: Option<&DeployedApi>,
        snapshot: &RegistrySnapshot,
        guard: RequestGuard,
    ) -> Exchange {
        if api.is_some() {
            let platform = self.chain(snapshot.platform());
            if let Err(e) = platform.execute(&mut ctx, Phase::Response).await {
                apply_error(&mut ctx, &e).await;
            }
        }

        self.processors.post_process(&mut ctx).await;

        let status = ctx.response.status.as_u16();
        let api_label = ctx.api_id.clone().unwrap_or_else(|| "none".to_string());
        Span::current().record("status", status);
        metrics::counter!(
            "gateway_requests_total",
            "api" => api_label.clone(),
            "status" => status.to_string()
        )
        .increment(1);
        metrics::histogram!("gateway_request_duration_seconds", "api" => api_label)
            .record(ctx.request.elapsed().as_secs_f64());
        info!(
            status,
            endpoint = ctx.endpoint.as_deref().unwrap_or("-"),
            duration_ms = ctx.request.elapsed().as_millis() as u64,
            "Request completed"
        );

        Exchange {
            context: ctx,
            guard,
        }
    }

    fn chain<'a>(&'a self, resolver: &'a FlowResolver) -> FlowChain<'a> {
        FlowChain::new(resolver, &self.filter, self.engine())
    }
}

/// Replace the response with the JSON error body of `error`
///
/// The transaction id header survives; every other response header is dropped.
async fn apply_error(ctx: &mut ExecutionContext, error: &GatewayError) {
    let status = error.status_code();
    if status.is_server_error() {
        warn!(error = %error, error_type = error.error_type(), "Request failed");
    } else {
        debug!(error = %error, error_type = error.error_type(), "Request rejected");
    }

    let mut headers = HeaderMap::new();
    if let Some(id) = ctx.response.headers.get(TRANSACTION_ID_HEADER) {
        headers.insert(TRANSACTION_ID_HEADER, id.clone());
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let body = Bytes::from(error.to_json().to_string());
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    ctx.response.status = status;
    ctx.response.headers = headers;
    let mut flow = BufferFlow::empty(BodyMode::Buffered);
    flow.set_body(body);
    ctx.response_body = flow;
}
