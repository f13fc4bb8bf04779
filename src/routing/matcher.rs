//! # Selector Matcher
//!
//! Compiles the path/method selectors of a flow into [`PathSelector`]s and
//! answers whether a request matches one of them.
//!
//! ## Operators
//! - `EQUALS`: the normalized path equals the pattern
//! - `STARTS_WITH`: the path equals the pattern or continues it at a segment
//!   boundary (`/items` matches `/items/1` but not `/itemsx`)
//! - `TEMPLATE`: segment template using `matchit` syntax (`/users/:id`,
//!   `/files/*rest`); captured parameters are exposed to conditions
//!
//! Patterns are compiled once at deployment. A malformed template is a
//! configuration error and the API is not activated.

use axum::http::Method;
use matchit::Router as RadixRouter;
use std::collections::HashMap;
use std::fmt;

use crate::core::definition::{PathOperator, SelectorDefinition};
use crate::core::error::{GatewayError, GatewayResult};

/// Ordering key used by best-match resolution
///
/// Fields compare in declaration order: longer literal prefix first, then a
/// selector restricted to the request method over a wildcard one, then an
/// exact operator over prefix or template matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    pub literal_len: usize,
    pub method_specific: bool,
    pub exact: bool,
}

/// A compiled path/method rule
pub struct PathSelector {
    pattern: String,
    operator: PathOperator,
    methods: Vec<Method>,
    template: Option<RadixRouter<()>>,
    literal_len: usize,
}

impl fmt::Debug for PathSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathSelector")
            .field("pattern", &self.pattern)
            .field("operator", &self.operator)
            .field("methods", &self.methods)
            .finish()
    }
}

impl PathSelector {
    /// Compile a selector definition
    pub fn compile(definition: &SelectorDefinition) -> GatewayResult<Self> {
        let pattern = normalize(&definition.path);

        let methods = definition
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.trim().to_uppercase().as_bytes())
                    .map_err(|e| GatewayError::config(format!("Invalid method '{}': {}", m, e)))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let (template, literal_len) = match definition.operator {
            PathOperator::Template => {
                let mut router = RadixRouter::new();
                router.insert(pattern.as_str(), ()).map_err(|e| {
                    GatewayError::config(format!("Invalid path template '{}': {}", pattern, e))
                })?;
                let literal_len = pattern
                    .find(|c| c == ':' || c == '*')
                    .unwrap_or(pattern.len());
                (Some(router), literal_len)
            }
            PathOperator::Equals | PathOperator::StartsWith => {
                if pattern.contains(':') || pattern.contains('*') {
                    return Err(GatewayError::config(format!(
                        "Path '{}' contains template characters; use the TEMPLATE operator",
                        pattern
                    )));
                }
                (None, pattern.len())
            }
        };

        Ok(Self {
            pattern,
            operator: definition.operator,
            methods,
            template,
            literal_len,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn operator(&self) -> PathOperator {
        self.operator
    }

    /// Check if this selector allows the given method
    pub fn matches_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    /// Whether the path matches, ignoring the method
    pub fn matches_path(&self, path: &str) -> bool {
        let path = normalize(path);
        match self.operator {
            PathOperator::Equals => path == self.pattern,
            PathOperator::StartsWith => {
                self.pattern == "/"
                    || path == self.pattern
                    || (path.starts_with(&self.pattern)
                        && path.as_bytes().get(self.pattern.len()) == Some(&b'/'))
            }
            PathOperator::Template => self
                .template
                .as_ref()
                .map(|t| t.at(&path).is_ok())
                .unwrap_or(false),
        }
    }

    pub fn matches(&self, path: &str, method: &Method) -> bool {
        self.matches_method(method) && self.matches_path(path)
    }

    /// Parameters captured by a template selector
    pub fn captures(&self, path: &str) -> HashMap<String, String> {
        let path = normalize(path);
        let Some(template) = self.template.as_ref() else {
            return HashMap::new();
        };
        match template.at(&path) {
            Ok(matched) => matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }

    pub fn specificity(&self, method: &Method) -> Specificity {
        Specificity {
            literal_len: self.literal_len,
            method_specific: !self.methods.is_empty() && self.methods.contains(method),
            exact: self.operator == PathOperator::Equals,
        }
    }
}

/// Compiled selectors of one flow
///
/// An empty set matches everything; otherwise any selector matching is enough.
#[derive(Debug, Default)]
pub struct SelectorSet {
    selectors: Vec<PathSelector>,
}

impl SelectorSet {
    pub fn compile(definitions: &[SelectorDefinition]) -> GatewayResult<Self> {
        let selectors = definitions
            .iter()
            .map(PathSelector::compile)
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { selectors })
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn matches(&self, path: &str, method: &Method) -> bool {
        self.selectors.is_empty() || self.selectors.iter().any(|s| s.matches(path, method))
    }

    /// Best specificity among matching selectors, `None` when nothing matches
    pub fn best_specificity(&self, path: &str, method: &Method) -> Option<Specificity> {
        if self.selectors.is_empty() {
            return Some(Specificity {
                literal_len: 0,
                method_specific: false,
                exact: false,
            });
        }
        self.selectors
            .iter()
            .filter(|s| s.matches(path, method))
            .map(|s| s.specificity(method))
            .max()
    }

    /// Captures of the first matching template selector
    pub fn captures(&self, path: &str, method: &Method) -> HashMap<String, String> {
        self.selectors
            .iter()
            .filter(|s| s.operator() == PathOperator::Template && s.matches(path, method))
            .map(|s| s.captures(path))
            .next()
            .unwrap_or_default()
    }
}

/// Leading slash, no trailing slash, no duplicate slashes
pub fn normalize(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(path: &str, operator: PathOperator, methods: &[&str]) -> PathSelector {
        PathSelector::compile(&SelectorDefinition {
            path: path.to_string(),
            operator,
            methods: methods.iter().map(|m| m.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_equals_operator() {
        let s = selector("/items", PathOperator::Equals, &[]);
        assert!(s.matches("/items", &Method::GET));
        assert!(s.matches("/items/", &Method::POST));
        assert!(!s.matches("/items/1", &Method::GET));
    }

    #[test]
    fn test_starts_with_respects_segments() {
        let s = selector("/items", PathOperator::StartsWith, &[]);
        assert!(s.matches("/items", &Method::GET));
        assert!(s.matches("/items/42/details", &Method::GET));
        assert!(!s.matches("/itemsx", &Method::GET));

        let root = selector("/", PathOperator::StartsWith, &[]);
        assert!(root.matches("/anything/at/all", &Method::DELETE));
    }

    #[test]
    fn test_template_operator_captures() {
        let s = selector("/users/:id/orders", PathOperator::Template, &["get"]);
        assert!(s.matches("/users/7/orders", &Method::GET));
        assert!(!s.matches("/users/7/orders", &Method::POST));
        assert!(!s.matches("/users/7", &Method::GET));
        assert_eq!(s.captures("/users/7/orders").get("id").unwrap(), "7");
    }

    #[test]
    fn test_method_restriction() {
        let s = selector("/items", PathOperator::StartsWith, &["GET", "put"]);
        assert!(s.matches("/items", &Method::GET));
        assert!(s.matches("/items", &Method::PUT));
        assert!(!s.matches("/items", &Method::DELETE));
    }

    #[test]
    fn test_malformed_template_rejected() {
        let result = PathSelector::compile(&SelectorDefinition {
            path: "/users/:".to_string(),
            operator: PathOperator::Template,
            methods: vec![],
        });
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn test_template_chars_rejected_outside_template() {
        let result = PathSelector::compile(&SelectorDefinition {
            path: "/users/:id".to_string(),
            operator: PathOperator::Equals,
            methods: vec![],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_method_rejected() {
        let result = PathSelector::compile(&SelectorDefinition {
            path: "/".to_string(),
            operator: PathOperator::StartsWith,
            methods: vec!["NOT A METHOD".to_string()],
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_specificity_ordering() {
        let long = selector("/a/b", PathOperator::StartsWith, &[]);
        let short = selector("/a", PathOperator::StartsWith, &["GET"]);
        assert!(long.specificity(&Method::GET) > short.specificity(&Method::GET));

        let with_method = selector("/a", PathOperator::StartsWith, &["GET"]);
        let any_method = selector("/a", PathOperator::StartsWith, &[]);
        assert!(with_method.specificity(&Method::GET) > any_method.specificity(&Method::GET));

        let exact = selector("/a", PathOperator::Equals, &[]);
        assert!(exact.specificity(&Method::GET) > any_method.specificity(&Method::GET));
    }

    #[test]
    fn test_empty_selector_set_matches_everything() {
        let set = SelectorSet::compile(&[]).unwrap();
        assert!(set.matches("/x/y", &Method::PATCH));
        assert!(set.best_specificity("/x", &Method::GET).is_some());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("a//b/"), "/a/b");
        assert_eq!(normalize("/"), "/");
    }
}
