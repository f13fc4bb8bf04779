//! # Condition Filters
//!
//! Narrow a candidate (flow, step, plan or message) according to its condition.
//!
//! Filters form a closed set:
//! - [`ExpressionFilter`] keeps candidates without a condition and evaluates
//!   the others through the [`ExpressionEngine`]; evaluation failures are
//!   logged and the candidate is dropped
//! - `Composite` runs filters in order and stops at the first rejection
//!
//! Filtering is asynchronous so expression evaluation may suspend.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::expression::ExpressionEngine;

/// Something that may carry a condition
pub trait Conditional {
    /// Condition expression, `None` or blank when unconditional
    fn condition(&self) -> Option<&str>;

    /// Short label used in logs
    fn label(&self) -> &str {
        ""
    }
}

/// Variables a condition is evaluated against
pub trait ConditionScope: Send + Sync {
    fn variables(&self) -> Value;
}

/// Fixed snapshot of template variables
#[derive(Debug, Clone)]
pub struct ScopeSnapshot(pub Value);

impl ConditionScope for ScopeSnapshot {
    fn variables(&self) -> Value {
        self.0.clone()
    }
}

/// Filter evaluating the candidate's own condition
#[derive(Clone)]
pub struct ExpressionFilter {
    engine: Arc<dyn ExpressionEngine>,
}

impl ExpressionFilter {
    pub fn new(engine: Arc<dyn ExpressionEngine>) -> Self {
        Self { engine }
    }

    pub async fn filter<C>(&self, scope: &dyn ConditionScope, candidate: C) -> Option<C>
    where
        C: Conditional + Send,
    {
        let keep = match candidate.condition().map(str::trim) {
            None | Some("") => true,
            Some(expression) => {
                match self.engine.evaluate(expression, &scope.variables()) {
                    Ok(result) => {
                        if !result {
                            debug!(candidate = candidate.label(), condition = expression, "Condition not met");
                        }
                        result
                    }
                    Err(e) => {
                        warn!(
                            candidate = candidate.label(),
                            condition = expression,
                            error = %e,
                            "Condition evaluation failed, skipping candidate"
                        );
                        metrics::counter!("gateway_condition_errors_total").increment(1);
                        false
                    }
                }
            }
        };

        keep.then_some(candidate)
    }
}

/// Closed set of condition filters
#[derive(Clone)]
pub enum ConditionFilter {
    Expression(ExpressionFilter),
    Composite(Vec<ConditionFilter>),
}

impl ConditionFilter {
    /// The filter used for flows, steps, plans and messages
    pub fn expression(engine: Arc<dyn ExpressionEngine>) -> Self {
        Self::Expression(ExpressionFilter::new(engine))
    }

    /// Keep or drop one candidate
    pub fn filter<'a, C>(&'a self, scope: &'a dyn ConditionScope, candidate: C) -> BoxFuture<'a, Option<C>>
    where
        C: Conditional + Send + 'a,
    {
        match self {
            Self::Expression(filter) => filter.filter(scope, candidate).boxed(),
            Self::Composite(filters) => async move {
                let mut current = candidate;
                for filter in filters {
                    current = filter.filter(scope, current).await?;
                }
                Some(current)
            }
            .boxed(),
        }
    }

    /// Keep the candidates that pass, preserving order
    pub async fn filter_all<C, I>(&self, scope: &dyn ConditionScope, candidates: I) -> Vec<C>
    where
        C: Conditional + Send,
        I: IntoIterator<Item = C>,
    {
        let mut kept = Vec::new();
        for candidate in candidates {
            if let Some(candidate) = self.filter(scope, candidate).await {
                kept.push(candidate);
            }
        }
        kept
    }
}
