//! # Expression Engine
//!
//! Conditions and templated step values are Tera expressions evaluated against
//! a JSON snapshot of the request (see `ExecutionContext::template_variables`).
//!
//! A condition is any Tera boolean expression:
//!
//! ```text
//! request.method == "GET" and request.headers["x-tier"] == "gold"
//! ```
//!
//! The `{# ... }` and `{{ ... }}` wrappers are accepted and stripped. Compiled
//! templates are cached per source string.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tera::{Context, Tera};

use crate::core::error::{GatewayError, GatewayResult};

const TEMPLATE_NAME: &str = "expression";

/// Evaluates conditions and renders templated values
pub trait ExpressionEngine: Send + Sync {
    /// Check that an expression compiles
    fn compile(&self, expression: &str) -> GatewayResult<()>;

    /// Evaluate a boolean condition
    fn evaluate(&self, expression: &str, variables: &Value) -> GatewayResult<bool>;

    /// Render a templated string; plain strings are returned unchanged
    fn render(&self, template: &str, variables: &Value) -> GatewayResult<String>;
}

/// [`ExpressionEngine`] backed by Tera
#[derive(Default)]
pub struct TeraEngine {
    conditions: DashMap<String, Arc<Tera>>,
    templates: DashMap<String, Arc<Tera>>,
}

impl TeraEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn condition_template(&self, expression: &str) -> GatewayResult<Arc<Tera>> {
        if let Some(compiled) = self.conditions.get(expression) {
            return Ok(compiled.clone());
        }
        let source = format!(
            "{{% if {} %}}true{{% else %}}false{{% endif %}}",
            strip_wrappers(expression)
        );
        let compiled = Arc::new(compile(&source).map_err(|e| with_expression(e, expression))?);
        self.conditions
            .insert(expression.to_string(), compiled.clone());
        Ok(compiled)
    }

    fn value_template(&self, template: &str) -> GatewayResult<Arc<Tera>> {
        if let Some(compiled) = self.templates.get(template) {
            return Ok(compiled.clone());
        }
        let compiled = Arc::new(compile(template).map_err(|e| with_expression(e, template))?);
        self.templates.insert(template.to_string(), compiled.clone());
        Ok(compiled)
    }
}

impl ExpressionEngine for TeraEngine {
    fn compile(&self, expression: &str) -> GatewayResult<()> {
        self.condition_template(expression).map(|_| ())
    }

    fn evaluate(&self, expression: &str, variables: &Value) -> GatewayResult<bool> {
        let tera = self.condition_template(expression)?;
        let context = Context::from_value(variables.clone())
            .map_err(|e| with_expression(e.into(), expression))?;
        let rendered = tera
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| with_expression(e.into(), expression))?;
        Ok(rendered == "true")
    }

    fn render(&self, template: &str, variables: &Value) -> GatewayResult<String> {
        if !is_templated(template) {
            return Ok(template.to_string());
        }
        let tera = self.value_template(template)?;
        let context = Context::from_value(variables.clone())
            .map_err(|e| with_expression(e.into(), template))?;
        tera.render(TEMPLATE_NAME, &context)
            .map_err(|e| with_expression(e.into(), template))
    }
}

fn compile(source: &str) -> Result<Tera, GatewayError> {
    let mut tera = Tera::default();
    tera.autoescape_on(vec![]);
    tera.add_raw_template(TEMPLATE_NAME, source)?;
    Ok(tera)
}

fn with_expression(error: GatewayError, expression: &str) -> GatewayError {
    match error {
        GatewayError::ConditionEvaluation { message, .. } => {
            GatewayError::condition(expression, message)
        }
        other => other,
    }
}

/// Whether a string contains template markup
pub fn is_templated(value: &str) -> bool {
    value.contains("{{") || value.contains("{%")
}

fn strip_wrappers(expression: &str) -> &str {
    let trimmed = expression.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{#")
        .and_then(|s| s.strip_suffix('}'))
    {
        return inner.trim();
    }
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
    {
        return inner.trim();
    }
    trimmed
}
