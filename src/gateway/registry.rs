//! # API Registry
//!
//! Holds the deployed APIs and the platform flows as one immutable snapshot.
//! A deployment compiles everything aside and swaps the whole snapshot in, so
//! a request always sees the platform flows and APIs of a single deployment.
//!
//! APIs that fail validation or compilation are not activated; the rest of
//! the deployment goes ahead.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::core::definition::{ApiDefinition, FlowDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::flow::chain::Phase;
use crate::flow::expression::ExpressionEngine;
use crate::flow::resolver::{compile_flows, FlowResolver, FlowResolverFactory, Plan};
use crate::load_balancing::group::EndpointArena;
use crate::routing::acceptor::AcceptorResolver;

/// An API compiled and ready to serve requests
pub struct DeployedApi {
    pub definition: ApiDefinition,
    pub resolver: FlowResolver,
    pub plans: Vec<Arc<Plan>>,
    pub endpoints: EndpointArena,
    /// Some step of the request phase needs the whole request body
    pub request_needs_body: bool,
    /// Some step of the response phase needs the whole response body
    pub response_needs_body: bool,
    pub deployed_at: DateTime<Utc>,
}

impl DeployedApi {
    pub fn compile(
        definition: &ApiDefinition,
        platform: &[FlowDefinition],
        engine: &dyn ExpressionEngine,
    ) -> GatewayResult<Self> {
        definition.validate()?;

        let flows = compile_flows(&definition.flows, engine)
            .map_err(|e| GatewayError::config(format!("api '{}': {}", definition.id, e)))?;
        let plans = definition
            .plans
            .iter()
            .map(|plan| Plan::compile(plan, definition.flow_mode, engine).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()
            .map_err(|e| GatewayError::config(format!("api '{}': {}", definition.id, e)))?;
        let endpoints = EndpointArena::build(
            &definition.endpoint_groups,
            definition.default_group_name(),
        )?;

        let all_flows = || {
            platform
                .iter()
                .chain(definition.flows.iter())
                .chain(definition.plans.iter().flat_map(|p| p.flows.iter()))
        };
        let request_needs_body = all_flows()
            .flat_map(|f| f.request.iter())
            .any(|s| s.enabled && s.action.needs_body());
        let response_needs_body = all_flows()
            .flat_map(|f| f.response.iter())
            .any(|s| s.enabled && s.action.needs_body());

        Ok(Self {
            definition: definition.clone(),
            resolver: FlowResolverFactory::api(definition.flow_mode, flows),
            plans,
            endpoints,
            request_needs_body,
            response_needs_body,
            deployed_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn needs_body(&self, phase: Phase) -> bool {
        match phase {
            Phase::Request => self.request_needs_body,
            Phase::Response => self.response_needs_body,
        }
    }
}

/// One consistent deployment
pub struct RegistrySnapshot {
    platform: FlowResolver,
    acceptors: AcceptorResolver<Arc<DeployedApi>>,
}

impl RegistrySnapshot {
    fn empty() -> Self {
        Self {
            platform: FlowResolverFactory::platform(Vec::new()),
            acceptors: AcceptorResolver::new(),
        }
    }

    pub fn platform(&self) -> &FlowResolver {
        &self.platform
    }

    /// API owning `path` and the path below its context path
    pub fn resolve(&self, path: &str) -> Option<(Arc<DeployedApi>, String)> {
        self.acceptors
            .resolve(path)
            .map(|(acceptor, path_info)| (acceptor.target().clone(), path_info))
    }

    pub fn api(&self, id: &str) -> Option<&Arc<DeployedApi>> {
        self.acceptors
            .iter()
            .map(|a| a.target())
            .find(|api| api.id() == id)
    }

    pub fn apis(&self) -> impl Iterator<Item = &Arc<DeployedApi>> {
        self.acceptors.iter().map(|a| a.target())
    }
}

/// Outcome of a deployment
#[derive(Debug, Default, Clone, Serialize)]
pub struct DeploymentReport {
    pub deployed: Vec<String>,
    /// API id and the reason it was not activated
    pub rejected: Vec<(String, String)>,
}

/// Registry of deployed APIs
pub struct ApiRegistry {
    engine: Arc<dyn ExpressionEngine>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ApiRegistry {
    pub fn new(engine: Arc<dyn ExpressionEngine>) -> Self {
        Self {
            engine,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::empty())),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ExpressionEngine> {
        &self.engine
    }

    /// Current deployment
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Replace the deployment with `platform` flows and `apis`
    ///
    /// Invalid platform flows fail the whole deployment and leave the current
    /// one in place. Invalid APIs are reported and skipped.
    pub fn deploy(
        &self,
        platform: &[FlowDefinition],
        apis: &[ApiDefinition],
    ) -> GatewayResult<DeploymentReport> {
        let platform_flows = compile_flows(platform, self.engine.as_ref())
            .map_err(|e| GatewayError::config(format!("platform flows: {}", e)))?;

        let mut report = DeploymentReport::default();
        let mut acceptors = AcceptorResolver::new();
        for definition in apis {
            let registered = DeployedApi::compile(definition, platform, self.engine.as_ref())
                .and_then(|api| acceptors.register(&definition.context_path, Arc::new(api)));
            match registered {
                Ok(()) => {
                    info!(api = %definition.id, context_path = %definition.context_path, "API deployed");
                    report.deployed.push(definition.id.clone());
                }
                Err(e) => {
                    error!(api = %definition.id, error = %e, "API rejected");
                    report.rejected.push((definition.id.clone(), e.to_string()));
                }
            }
        }

        let snapshot = RegistrySnapshot {
            platform: FlowResolverFactory::platform(platform_flows),
            acceptors,
        };
        metrics::gauge!("gateway_deployed_apis").set(snapshot.acceptors.len() as f64);
        *self.snapshot.write() = Arc::new(snapshot);

        Ok(report)
    }

    /// Mark an endpoint of a deployed API available or not
    pub fn set_endpoint_available(
        &self,
        api: &str,
        group: &str,
        endpoint: &str,
        available: bool,
    ) -> GatewayResult<()> {
        let snapshot = self.snapshot();
        let api = snapshot
            .api(api)
            .ok_or_else(|| GatewayError::config(format!("api '{}' is not deployed", api)))?;
        let group = api
            .endpoints
            .group(group)
            .ok_or_else(|| GatewayError::no_endpoint(group))?;
        group.set_available(endpoint, available)
    }
}
