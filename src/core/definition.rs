//! # API Definitions
//!
//! Declarative description of a deployed API as read from configuration: its
//! context path, flows, plans and endpoint groups. Definitions are plain serde
//! data; they are compiled into matchers, resolvers and selectors when the API
//! is deployed and are never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};

/// How flows are picked for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowMode {
    /// Every matching flow runs, in declaration order
    #[default]
    Default,
    /// Only the single most specific matching flow runs
    BestMatch,
}

/// Path comparison operator of a selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathOperator {
    Equals,
    #[default]
    StartsWith,
    /// Segment template such as `/users/:id`
    Template,
}

/// Configured body transport policy for an API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyModeSetting {
    /// Stream unless a resolved step needs the whole body
    #[default]
    Auto,
    Buffered,
    Streaming,
}

/// Path and method rule attached to a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorDefinition {
    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default)]
    pub operator: PathOperator,

    /// Empty means any method
    #[serde(default)]
    pub methods: Vec<String>,
}

impl Default for SelectorDefinition {
    fn default() -> Self {
        Self {
            path: default_path(),
            operator: PathOperator::default(),
            methods: Vec::new(),
        }
    }
}

/// One step of a flow phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub condition: Option<String>,

    #[serde(flatten)]
    pub action: StepAction,
}

/// What a step does when it runs
///
/// Header names are applied to the request during the request phase and to the
/// response during the response phase. String values may be templates
/// (`{{ request.headers["x-user"] }}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum StepAction {
    SetHeader {
        header: String,
        value: String,
    },
    RemoveHeader {
        header: String,
    },
    SetAttribute {
        attribute: String,
        value: serde_json::Value,
    },
    ReplaceBody {
        content: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    Interrupt {
        status: u16,
        #[serde(default)]
        message: String,
    },
    /// Drop newline-delimited messages whose condition does not hold
    FilterMessages {
        message_condition: String,
    },
}

impl StepAction {
    /// Whether the step needs the whole body in memory
    pub fn needs_body(&self) -> bool {
        matches!(self, Self::ReplaceBody { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetHeader { .. } => "set-header",
            Self::RemoveHeader { .. } => "remove-header",
            Self::SetAttribute { .. } => "set-attribute",
            Self::ReplaceBody { .. } => "replace-body",
            Self::Interrupt { .. } => "interrupt",
            Self::FilterMessages { .. } => "filter-messages",
        }
    }
}

/// A flow: selectors, an optional condition and two ordered step lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// A flow without selectors applies to every path and method
    #[serde(default)]
    pub selectors: Vec<SelectorDefinition>,

    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub request: Vec<StepDefinition>,

    #[serde(default)]
    pub response: Vec<StepDefinition>,
}

/// A consumer plan with its own flows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub name: String,

    /// Condition deciding whether the plan applies to a request
    #[serde(default)]
    pub selection_rule: Option<String>,

    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
}

/// Locally answered response used in place of a backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockDefinition {
    #[serde(default = "default_mock_status")]
    pub status: u16,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDefinition {
    pub name: String,

    /// Base URL requests are forwarded to
    #[serde(default)]
    pub target: String,

    /// Values at or below zero count as one
    #[serde(default = "default_weight")]
    pub weight: i32,

    /// Backup endpoints are only used when no primary is available
    #[serde(default = "default_true")]
    pub primary: bool,

    #[serde(default)]
    pub mock: Option<MockDefinition>,
}

impl EndpointDefinition {
    /// Weight with the floor of one applied
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointGroupDefinition {
    pub name: String,

    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

/// A deployable API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Path prefix under which the API is exposed
    pub context_path: String,

    #[serde(default)]
    pub flow_mode: FlowMode,

    #[serde(default)]
    pub body_mode: BodyModeSetting,

    #[serde(default)]
    pub flows: Vec<FlowDefinition>,

    #[serde(default)]
    pub plans: Vec<PlanDefinition>,

    pub endpoint_groups: Vec<EndpointGroupDefinition>,

    /// Group used when no flow picked one; defaults to the first group
    #[serde(default)]
    pub default_group: Option<String>,

    /// Overrides the server-wide request timeout
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
}

impl ApiDefinition {
    /// Name of the group used when the request does not ask for one
    pub fn default_group_name(&self) -> Option<&str> {
        self.default_group
            .as_deref()
            .or_else(|| self.endpoint_groups.first().map(|g| g.name.as_str()))
    }

    /// Structural validation; selectors and conditions are checked when compiled
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("id cannot be empty".to_string());
        }
        if !self.context_path.starts_with('/') {
            errors.push(format!(
                "context_path '{}' must start with '/'",
                self.context_path
            ));
        }
        if self.endpoint_groups.is_empty() {
            errors.push("at least one endpoint group is required".to_string());
        }

        let mut group_names = HashSet::new();
        for group in &self.endpoint_groups {
            if !group_names.insert(group.name.as_str()) {
                errors.push(format!("duplicate endpoint group '{}'", group.name));
            }
            let mut endpoint_names = HashSet::new();
            for endpoint in &group.endpoints {
                if !endpoint_names.insert(endpoint.name.as_str()) {
                    errors.push(format!(
                        "duplicate endpoint '{}' in group '{}'",
                        endpoint.name, group.name
                    ));
                }
                if endpoint.mock.is_none() {
                    if let Err(e) = Url::parse(&endpoint.target) {
                        errors.push(format!(
                            "endpoint '{}' has invalid target '{}': {}",
                            endpoint.name, endpoint.target, e
                        ));
                    }
                }
            }
        }

        if let Some(ref default_group) = self.default_group {
            if !group_names.contains(default_group.as_str()) {
                errors.push(format!("default_group '{}' does not exist", default_group));
            }
        }

        let mut plan_names = HashSet::new();
        for plan in &self.plans {
            if !plan_names.insert(plan.name.as_str()) {
                errors.push(format!("duplicate plan '{}'", plan.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(format!(
                "API '{}' is invalid: {}",
                self.id,
                errors.join("; ")
            )))
        }
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_weight() -> i32 {
    1
}

fn default_mock_status() -> u16 {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> ApiDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let api = parse(
            r#"
id: orders
context_path: /orders
endpoint_groups:
  - name: default
    endpoints:
      - name: e1
        target: http://localhost:9000
flows:
  - selectors:
      - path: /items
"#,
        );
        assert_eq!(api.flow_mode, FlowMode::Default);
        assert_eq!(api.body_mode, BodyModeSetting::Auto);
        assert!(api.flows[0].enabled);
        assert_eq!(api.flows[0].selectors[0].operator, PathOperator::StartsWith);
        assert_eq!(api.endpoint_groups[0].endpoints[0].weight, 1);
        assert!(api.endpoint_groups[0].endpoints[0].primary);
        assert_eq!(api.default_group_name(), Some("default"));
        assert!(api.validate().is_ok());
    }

    #[test]
    fn test_step_actions_parse() {
        let step: StepDefinition = serde_yaml::from_str(
            r#"
name: tag
action: set-header
header: x-flow
value: a
condition: "request.method == 'GET'"
"#,
        )
        .unwrap();
        assert_eq!(
            step.action,
            StepAction::SetHeader {
                header: "x-flow".into(),
                value: "a".into()
            }
        );
        assert_eq!(step.name, "tag");
        assert!(step.enabled);

        let step: StepDefinition =
            serde_yaml::from_str("action: interrupt\nstatus: 403\n").unwrap();
        assert_eq!(step.action.kind(), "interrupt");
    }

    #[test]
    fn test_best_match_mode_parses() {
        let mode: FlowMode = serde_yaml::from_str("BEST_MATCH").unwrap();
        assert_eq!(mode, FlowMode::BestMatch);
    }

    #[test]
    fn test_effective_weight_floor() {
        let mut endpoint = EndpointDefinition {
            name: "e".into(),
            target: "http://x".into(),
            weight: 0,
            primary: true,
            mock: None,
        };
        assert_eq!(endpoint.effective_weight(), 1);
        endpoint.weight = -4;
        assert_eq!(endpoint.effective_weight(), 1);
        endpoint.weight = 7;
        assert_eq!(endpoint.effective_weight(), 7);
    }

    #[test]
    fn test_validation_collects_errors() {
        let api = parse(
            r#"
id: broken
context_path: broken
default_group: missing
endpoint_groups:
  - name: g
    endpoints:
      - name: e1
        target: "not a url"
"#,
        );
        let err = api.validate().unwrap_err().to_string();
        assert!(err.contains("context_path"));
        assert!(err.contains("invalid target"));
        assert!(err.contains("default_group"));
    }

    #[test]
    fn test_mock_endpoint_needs_no_target() {
        let api = parse(
            r#"
id: mocked
context_path: /mock
endpoint_groups:
  - name: g
    endpoints:
      - name: m
        mock:
          status: 204
"#,
        );
        assert!(api.validate().is_ok());
        assert_eq!(
            api.endpoint_groups[0].endpoints[0].mock.as_ref().unwrap().status,
            204
        );
    }
}
