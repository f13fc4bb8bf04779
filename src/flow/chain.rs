//! # Flow Chain
//!
//! Runs the flows of one scope for one phase. Flows come from the scope's
//! resolver, are narrowed by the condition filter, and run strictly in order;
//! inside a flow, enabled steps whose condition holds run in declaration order.
//! An `interrupt` step stops the chain with an error carrying its status.

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::core::context::ExecutionContext;
use crate::core::definition::{StepAction, StepDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::flow::condition::{ConditionFilter, ScopeSnapshot};
use crate::flow::expression::ExpressionEngine;
use crate::flow::messages::MessageFilter;
use crate::flow::resolver::FlowResolver;

/// Request or response side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request,
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
        }
    }
}

/// Executes the resolved flows of one resolver
pub struct FlowChain<'a> {
    resolver: &'a FlowResolver,
    filter: &'a ConditionFilter,
    engine: &'a Arc<dyn ExpressionEngine>,
}

impl<'a> FlowChain<'a> {
    pub fn new(
        resolver: &'a FlowResolver,
        filter: &'a ConditionFilter,
        engine: &'a Arc<dyn ExpressionEngine>,
    ) -> Self {
        Self {
            resolver,
            filter,
            engine,
        }
    }

    pub async fn execute(&self, ctx: &mut ExecutionContext, phase: Phase) -> GatewayResult<()> {
        let path = ctx.request.path_info.clone();
        let method = ctx.request.method.clone();
        let scope = self.resolver.scope();

        for flow in self.resolver.resolve(&path, &method) {
            let snapshot = ScopeSnapshot(ctx.template_variables());
            let Some(flow) = self.filter.filter(&snapshot, flow).await else {
                metrics::counter!("gateway_flows_skipped_total", "scope" => scope).increment(1);
                continue;
            };

            if phase == Phase::Request {
                ctx.request
                    .path_params
                    .extend(flow.selectors.captures(&path, &method));
            }

            let started = Instant::now();
            let steps = match phase {
                Phase::Request => &flow.request,
                Phase::Response => &flow.response,
            };
            for step in steps.iter().filter(|s| s.enabled) {
                let snapshot = ScopeSnapshot(ctx.template_variables());
                if self.filter.filter(&snapshot, step).await.is_none() {
                    continue;
                }
                debug!(scope, flow = %flow.name, step = %step.name, action = step.action.kind(), %phase, "Executing step");
                self.execute_step(ctx, step, phase, snapshot.0).await?;
            }

            metrics::counter!("gateway_flows_executed_total", "scope" => scope, "phase" => phase.to_string())
                .increment(1);
            metrics::histogram!("gateway_flow_duration_seconds", "scope" => scope)
                .record(started.elapsed().as_secs_f64());
        }

        Ok(())
    }

    async fn execute_step(
        &self,
        ctx: &mut ExecutionContext,
        step: &StepDefinition,
        phase: Phase,
        variables: Value,
    ) -> GatewayResult<()> {
        match &step.action {
            StepAction::SetHeader { header, value } => {
                let value = self.engine.render(value, &variables)?;
                let headers = headers_for(ctx, phase);
                headers.insert(header_name(header)?, header_value(&value)?);
            }
            StepAction::RemoveHeader { header } => {
                headers_for(ctx, phase).remove(header_name(header)?);
            }
            StepAction::SetAttribute { attribute, value } => {
                let value = match value {
                    Value::String(s) => Value::String(self.engine.render(s, &variables)?),
                    other => other.clone(),
                };
                ctx.attributes.insert(attribute.clone(), value);
            }
            StepAction::ReplaceBody {
                content,
                content_type,
            } => {
                let rendered = Bytes::from(self.engine.render(content, &variables)?);
                let body = body_for(ctx, phase);
                if body.is_streaming() {
                    debug!(step = %step.name, "Body replacement skipped on streamed body");
                    return Ok(());
                }
                body.on_body(|_| async move { Ok(rendered) }).await?;
                let headers = headers_for(ctx, phase);
                headers.remove(CONTENT_LENGTH);
                if let Some(content_type) = content_type {
                    headers.insert(CONTENT_TYPE, header_value(content_type)?);
                }
            }
            StepAction::Interrupt { status, message } => {
                let message = self.engine.render(message, &variables)?;
                return Err(GatewayError::interrupted(*status, message));
            }
            StepAction::FilterMessages { message_condition } => {
                let filter = MessageFilter::new(self.filter.clone(), message_condition, variables);
                let body = body_for(ctx, phase);
                if body.is_streaming() {
                    let limit = body.limit();
                    body.map_chunks(|chunks| filter.filter_stream(chunks, limit));
                } else {
                    body.on_body(|content| async move { Ok(filter.filter_buffer(content).await) })
                        .await?;
                    headers_for(ctx, phase).remove(CONTENT_LENGTH);
                }
            }
        }
        Ok(())
    }
}

fn headers_for(ctx: &mut ExecutionContext, phase: Phase) -> &mut HeaderMap {
    match phase {
        Phase::Request => &mut ctx.request.headers,
        Phase::Response => &mut ctx.response.headers,
    }
}

fn body_for(ctx: &mut ExecutionContext, phase: Phase) -> &mut crate::proxy::body::BufferFlow {
    match phase {
        Phase::Request => &mut ctx.request_body,
        Phase::Response => &mut ctx.response_body,
    }
}

fn header_name(name: &str) -> GatewayResult<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| GatewayError::internal(format!("invalid header name '{}': {}", name, e)))
}

fn header_value(value: &str) -> GatewayResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::internal(format!("invalid header value '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::definition::{FlowDefinition, FlowMode, SelectorDefinition};
    use crate::core::types::IncomingRequest;
    use crate::flow::expression::TeraEngine;
    use crate::flow::resolver::{compile_flows, FlowResolverFactory};
    use crate::proxy::body::{BodyMode, BufferFlow};
    use axum::http::{Method, Version};
    use futures::stream::{self, StreamExt};
    use serde_json::json;

    fn step(action: StepAction) -> StepDefinition {
        StepDefinition {
            name: action.kind().to_string(),
            enabled: true,
            condition: None,
            action,
        }
    }

    fn flow(name: &str, request: Vec<StepDefinition>, response: Vec<StepDefinition>) -> FlowDefinition {
        FlowDefinition {
            name: name.to_string(),
            enabled: true,
            selectors: vec![SelectorDefinition::default()],
            condition: None,
            request,
            response,
        }
    }

    fn context(method: Method, mode: BodyMode) -> ExecutionContext {
        let request = IncomingRequest::new(
            method,
            "/items".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        ExecutionContext::new(request, BufferFlow::empty(mode))
    }

    async fn run(defs: &[FlowDefinition], ctx: &mut ExecutionContext, phase: Phase) -> GatewayResult<()> {
        let engine: Arc<dyn ExpressionEngine> = Arc::new(TeraEngine::new());
        let flows = compile_flows(defs, engine.as_ref()).unwrap();
        let resolver = FlowResolverFactory::api(FlowMode::Default, flows);
        let filter = ConditionFilter::expression(engine.clone());
        FlowChain::new(&resolver, &filter, &engine).execute(ctx, phase).await
    }

    #[tokio::test]
    async fn test_steps_run_in_flow_order() {
        let defs = vec![
            flow(
                "first",
                vec![step(StepAction::SetHeader { header: "x-trace".into(), value: "first".into() })],
                vec![],
            ),
            flow(
                "second",
                vec![step(StepAction::SetHeader {
                    header: "x-trace".into(),
                    value: "{{ request.headers['x-trace'] }},second".into(),
                })],
                vec![],
            ),
        ];
        let mut ctx = context(Method::GET, BodyMode::Buffered);
        run(&defs, &mut ctx, Phase::Request).await.unwrap();
        assert_eq!(ctx.request.header("x-trace"), Some("first,second"));
    }

    #[tokio::test]
    async fn test_flow_condition_skips_flow() {
        let mut conditional = flow(
            "post-only",
            vec![step(StepAction::SetAttribute { attribute: "hit".into(), value: json!(true) })],
            vec![],
        );
        conditional.condition = Some("request.method == 'POST'".into());

        let mut ctx = context(Method::GET, BodyMode::Buffered);
        run(&[conditional.clone()], &mut ctx, Phase::Request).await.unwrap();
        assert!(!ctx.attributes.contains_key("hit"));

        let mut ctx = context(Method::POST, BodyMode::Buffered);
        run(&[conditional], &mut ctx, Phase::Request).await.unwrap();
        assert_eq!(ctx.attributes.get("hit"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_failing_step_condition_skips_only_that_step() {
        let mut broken = step(StepAction::SetAttribute { attribute: "a".into(), value: json!(1) });
        broken.condition = Some("request.headers.missing == 'x'".into());
        let fine = step(StepAction::SetAttribute { attribute: "b".into(), value: json!(2) });

        let mut ctx = context(Method::GET, BodyMode::Buffered);
        run(&[flow("f", vec![broken, fine], vec![])], &mut ctx, Phase::Request)
            .await
            .unwrap();
        assert!(!ctx.attributes.contains_key("a"));
        assert_eq!(ctx.attributes.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_interrupt_stops_chain() {
        let defs = vec![
            flow(
                "deny",
                vec![step(StepAction::Interrupt { status: 403, message: "denied".into() })],
                vec![],
            ),
            flow(
                "never",
                vec![step(StepAction::SetAttribute { attribute: "reached".into(), value: json!(true) })],
                vec![],
            ),
        ];
        let mut ctx = context(Method::GET, BodyMode::Buffered);
        let err = run(&defs, &mut ctx, Phase::Request).await.unwrap_err();
        assert_eq!(err.status_code().as_u16(), 403);
        assert!(!ctx.attributes.contains_key("reached"));
    }

    #[tokio::test]
    async fn test_replace_response_body() {
        let defs = vec![flow(
            "rewrite",
            vec![],
            vec![step(StepAction::ReplaceBody {
                content: "{\"method\":\"{{ request.method }}\"}".into(),
                content_type: Some("application/json".into()),
            })],
        )];
        let mut ctx = context(Method::GET, BodyMode::Buffered);
        ctx.response_body.set_body(Bytes::from_static(b"original"));
        run(&defs, &mut ctx, Phase::Response).await.unwrap();

        assert_eq!(ctx.response_body.body().await.unwrap().unwrap(), "{\"method\":\"GET\"}");
        assert_eq!(ctx.response.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_filter_messages_on_streamed_body() {
        let defs = vec![flow(
            "only-even",
            vec![],
            vec![step(StepAction::FilterMessages {
                message_condition: "message.json.n is divisibleby(2)".into(),
            })],
        )];
        let mut ctx = context(Method::GET, BodyMode::Streaming);
        let source: Vec<GatewayResult<Bytes>> = vec![Ok(Bytes::from_static(
            b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n{\"n\":4}\n",
        ))];
        ctx.response_body = BufferFlow::new(Some(stream::iter(source).boxed()), BodyMode::Streaming);

        run(&defs, &mut ctx, Phase::Response).await.unwrap();

        let chunks: Vec<Bytes> = ctx
            .response_body
            .chunks()
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["{\"n\":2}\n", "{\"n\":4}\n"]);
    }
}
