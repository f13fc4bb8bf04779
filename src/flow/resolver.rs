//! # Flow Resolution
//!
//! A [`FlowResolver`] turns a request path and method into the ordered flows
//! to run. Resolution is lazy and starts fresh on every call.
//!
//! - In-order resolution yields every enabled, matching flow in declaration order
//! - Best-match resolution yields at most one flow: the most specific match,
//!   ties going to the first declared
//!
//! [`FlowResolverFactory`] is the single place where an API's [`FlowMode`] is
//! turned into a resolution strategy. Platform flows always resolve in order.

use axum::http::Method;
use std::slice;
use std::sync::Arc;

use crate::core::definition::{FlowDefinition, FlowMode, PlanDefinition, StepDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::flow::condition::Conditional;
use crate::flow::expression::ExpressionEngine;
use crate::routing::matcher::{SelectorSet, Specificity};

/// A flow compiled for execution
#[derive(Debug)]
pub struct Flow {
    pub name: String,
    pub enabled: bool,
    pub selectors: SelectorSet,
    pub condition: Option<String>,
    pub request: Vec<StepDefinition>,
    pub response: Vec<StepDefinition>,
}

impl Flow {
    /// Compile selectors and check every condition of the flow
    pub fn compile(definition: &FlowDefinition, engine: &dyn ExpressionEngine) -> GatewayResult<Self> {
        let selectors = SelectorSet::compile(&definition.selectors)
            .map_err(|e| GatewayError::config(format!("flow '{}': {}", definition.name, e)))?;

        let conditions = definition
            .condition
            .iter()
            .chain(
                definition
                    .request
                    .iter()
                    .chain(definition.response.iter())
                    .filter_map(|s| s.condition.as_ref()),
            )
            .filter(|c| !c.trim().is_empty());
        for condition in conditions {
            engine.compile(condition).map_err(|e| {
                GatewayError::config(format!("flow '{}': {}", definition.name, e))
            })?;
        }

        Ok(Self {
            name: definition.name.clone(),
            enabled: definition.enabled,
            selectors,
            condition: definition.condition.clone(),
            request: definition.request.clone(),
            response: definition.response.clone(),
        })
    }

    /// Enabled and matching the request
    pub fn applies_to(&self, path: &str, method: &Method) -> bool {
        self.enabled && self.selectors.matches(path, method)
    }
}

impl Conditional for Arc<Flow> {
    fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    fn label(&self) -> &str {
        &self.name
    }
}

impl Conditional for &StepDefinition {
    fn condition(&self) -> Option<&str> {
        self.condition.as_deref()
    }

    fn label(&self) -> &str {
        &self.name
    }
}

/// A plan compiled for execution
#[derive(Debug)]
pub struct Plan {
    pub name: String,
    pub selection_rule: Option<String>,
    pub resolver: FlowResolver,
}

impl Plan {
    pub fn compile(
        definition: &PlanDefinition,
        mode: FlowMode,
        engine: &dyn ExpressionEngine,
    ) -> GatewayResult<Self> {
        if let Some(rule) = definition.selection_rule.as_deref().filter(|r| !r.trim().is_empty()) {
            engine.compile(rule).map_err(|e| {
                GatewayError::config(format!("plan '{}': {}", definition.name, e))
            })?;
        }
        let flows = compile_flows(&definition.flows, engine)?;
        Ok(Self {
            name: definition.name.clone(),
            selection_rule: definition.selection_rule.clone(),
            resolver: FlowResolverFactory::plan(mode, flows),
        })
    }
}

impl Conditional for Arc<Plan> {
    fn condition(&self) -> Option<&str> {
        self.selection_rule.as_deref()
    }

    fn label(&self) -> &str {
        &self.name
    }
}

pub fn compile_flows(
    definitions: &[FlowDefinition],
    engine: &dyn ExpressionEngine,
) -> GatewayResult<Vec<Arc<Flow>>> {
    definitions
        .iter()
        .map(|d| Flow::compile(d, engine).map(Arc::new))
        .collect()
}

/// How a resolver picks flows among the matching ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    InOrder,
    BestMatch,
}

/// Resolves the flows of one scope (platform, api or plan)
#[derive(Debug)]
pub struct FlowResolver {
    scope: &'static str,
    flows: Vec<Arc<Flow>>,
    strategy: ResolutionStrategy,
}

impl FlowResolver {
    pub fn new(scope: &'static str, flows: Vec<Arc<Flow>>, strategy: ResolutionStrategy) -> Self {
        Self {
            scope,
            flows,
            strategy,
        }
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    pub fn flows(&self) -> &[Arc<Flow>] {
        &self.flows
    }

    /// Flows to run for the request, in execution order
    pub fn resolve<'a>(&'a self, path: &'a str, method: &'a Method) -> ResolvedFlows<'a> {
        match self.strategy {
            ResolutionStrategy::InOrder => ResolvedFlows::InOrder {
                flows: self.flows.iter(),
                path,
                method,
            },
            ResolutionStrategy::BestMatch => {
                ResolvedFlows::Best(best_match(&self.flows, path, method).into_iter())
            }
        }
    }
}

/// Lazy sequence returned by [`FlowResolver::resolve`]
pub enum ResolvedFlows<'a> {
    InOrder {
        flows: slice::Iter<'a, Arc<Flow>>,
        path: &'a str,
        method: &'a Method,
    },
    Best(std::option::IntoIter<Arc<Flow>>),
}

impl Iterator for ResolvedFlows<'_> {
    type Item = Arc<Flow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::InOrder { flows, path, method } => {
                let (path, method) = (*path, *method);
                flows.find(|f| f.applies_to(path, method)).cloned()
            }
            Self::Best(best) => best.next(),
        }
    }
}

fn best_match(flows: &[Arc<Flow>], path: &str, method: &Method) -> Option<Arc<Flow>> {
    let mut best: Option<(Specificity, &Arc<Flow>)> = None;
    for flow in flows.iter().filter(|f| f.enabled) {
        let Some(score) = flow.selectors.best_specificity(path, method) else {
            continue;
        };
        // strict comparison keeps the first declared flow on ties
        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, flow));
        }
    }
    best.map(|(_, flow)| flow.clone())
}

/// Builds resolvers for each scope from the API flow mode
pub struct FlowResolverFactory;

impl FlowResolverFactory {
    fn strategy(mode: FlowMode) -> ResolutionStrategy {
        match mode {
            FlowMode::Default => ResolutionStrategy::InOrder,
            FlowMode::BestMatch => ResolutionStrategy::BestMatch,
        }
    }

    pub fn platform(flows: Vec<Arc<Flow>>) -> FlowResolver {
        FlowResolver::new("platform", flows, ResolutionStrategy::InOrder)
    }

    pub fn api(mode: FlowMode, flows: Vec<Arc<Flow>>) -> FlowResolver {
        FlowResolver::new("api", flows, Self::strategy(mode))
    }

    pub fn plan(mode: FlowMode, flows: Vec<Arc<Flow>>) -> FlowResolver {
        FlowResolver::new("plan", flows, Self::strategy(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::definition::{PathOperator, SelectorDefinition};
    use crate::flow::expression::TeraEngine;

    fn flow(name: &str, path: &str, operator: PathOperator, methods: &[&str]) -> FlowDefinition {
        FlowDefinition {
            name: name.to_string(),
            enabled: true,
            selectors: vec![SelectorDefinition {
                path: path.to_string(),
                operator,
                methods: methods.iter().map(|m| m.to_string()).collect(),
            }],
            condition: None,
            request: vec![],
            response: vec![],
        }
    }

    fn compile(defs: &[FlowDefinition]) -> Vec<Arc<Flow>> {
        compile_flows(defs, &TeraEngine::new()).unwrap()
    }

    fn names(resolved: ResolvedFlows<'_>) -> Vec<String> {
        resolved.map(|f| f.name.clone()).collect()
    }

    #[test]
    fn test_default_mode_keeps_declaration_order() {
        let flows = compile(&[
            flow("all", "/", PathOperator::StartsWith, &[]),
            flow("items", "/items", PathOperator::StartsWith, &["GET"]),
            flow("orders", "/orders", PathOperator::StartsWith, &[]),
            flow("items-any", "/items", PathOperator::StartsWith, &[]),
        ]);
        let resolver = FlowResolverFactory::api(FlowMode::Default, flows);
        assert_eq!(
            names(resolver.resolve("/items/1", &Method::GET)),
            vec!["all", "items", "items-any"]
        );
        assert_eq!(
            names(resolver.resolve("/items/1", &Method::POST)),
            vec!["all", "items-any"]
        );
    }

    #[test]
    fn test_disabled_flow_never_resolved() {
        let mut defs = vec![
            flow("off", "/", PathOperator::StartsWith, &[]),
            flow("on", "/", PathOperator::StartsWith, &[]),
        ];
        defs[0].enabled = false;
        let flows = compile(&defs);

        for mode in [FlowMode::Default, FlowMode::BestMatch] {
            let resolver = FlowResolverFactory::api(mode, flows.clone());
            assert_eq!(names(resolver.resolve("/x", &Method::GET)), vec!["on"]);
        }
    }

    #[test]
    fn test_best_match_picks_most_specific() {
        let flows = compile(&[
            flow("root", "/", PathOperator::StartsWith, &[]),
            flow("items", "/items", PathOperator::StartsWith, &[]),
            flow("item", "/items/:id", PathOperator::Template, &[]),
            flow("items-detail", "/items/special", PathOperator::StartsWith, &[]),
        ]);
        let resolver = FlowResolverFactory::api(FlowMode::BestMatch, flows);
        assert_eq!(names(resolver.resolve("/items/special", &Method::GET)), vec!["items-detail"]);
        assert_eq!(names(resolver.resolve("/items/7", &Method::GET)), vec!["item"]);
        assert_eq!(names(resolver.resolve("/other", &Method::GET)), vec!["root"]);
    }

    #[test]
    fn test_best_match_prefers_method_then_exact() {
        let flows = compile(&[
            flow("any", "/items", PathOperator::StartsWith, &[]),
            flow("get", "/items", PathOperator::StartsWith, &["GET"]),
            flow("exact", "/items", PathOperator::Equals, &[]),
        ]);
        let resolver = FlowResolverFactory::api(FlowMode::BestMatch, flows);
        assert_eq!(names(resolver.resolve("/items", &Method::GET)), vec!["get"]);
        assert_eq!(names(resolver.resolve("/items", &Method::POST)), vec!["exact"]);
    }

    #[test]
    fn test_best_match_tie_goes_to_first_declared() {
        let flows = compile(&[
            flow("first", "/a", PathOperator::StartsWith, &[]),
            flow("second", "/a", PathOperator::StartsWith, &[]),
        ]);
        let resolver = FlowResolverFactory::api(FlowMode::BestMatch, flows);
        assert_eq!(names(resolver.resolve("/a/b", &Method::GET)), vec!["first"]);
    }

    #[test]
    fn test_best_match_yields_at_most_one() {
        let flows = compile(&[
            flow("a", "/", PathOperator::StartsWith, &[]),
            flow("b", "/x", PathOperator::StartsWith, &[]),
            flow("c", "/x/y", PathOperator::StartsWith, &[]),
        ]);
        let resolver = FlowResolverFactory::api(FlowMode::BestMatch, flows);
        for path in ["/", "/x", "/x/y/z", "/nope"] {
            assert!(resolver.resolve(path, &Method::GET).count() <= 1);
        }
    }

    #[test]
    fn test_no_match_yields_empty() {
        let flows = compile(&[flow("items", "/items", PathOperator::Equals, &[])]);
        for mode in [FlowMode::Default, FlowMode::BestMatch] {
            let resolver = FlowResolverFactory::api(mode, flows.clone());
            assert_eq!(resolver.resolve("/other", &Method::GET).count(), 0);
        }
    }

    #[test]
    fn test_platform_resolver_ignores_best_match() {
        let flows = compile(&[
            flow("a", "/", PathOperator::StartsWith, &[]),
            flow("b", "/", PathOperator::StartsWith, &[]),
        ]);
        let resolver = FlowResolverFactory::platform(flows);
        assert_eq!(resolver.strategy(), ResolutionStrategy::InOrder);
        assert_eq!(names(resolver.resolve("/", &Method::GET)), vec!["a", "b"]);
    }

    #[test]
    fn test_resolution_is_fresh_per_call() {
        let flows = compile(&[flow("a", "/", PathOperator::StartsWith, &[])]);
        let resolver = FlowResolverFactory::api(FlowMode::Default, flows);
        let mut first = resolver.resolve("/", &Method::GET);
        assert!(first.next().is_some());
        assert_eq!(resolver.resolve("/", &Method::GET).count(), 1);
    }

    #[test]
    fn test_invalid_condition_rejected_at_compile() {
        let mut def = flow("bad", "/", PathOperator::StartsWith, &[]);
        def.condition = Some("request.method ==".to_string());
        let err = Flow::compile(&def, &TeraEngine::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
