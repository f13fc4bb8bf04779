//! # Acceptor Resolution
//!
//! Maps an incoming path to the deployed API owning it. Each API listens on a
//! context path; the longest context path that is a segment prefix of the
//! request path wins, and the remainder becomes the path seen by flows.

use super::matcher::normalize;
use crate::core::error::{GatewayError, GatewayResult};

/// One API listening on a context path
#[derive(Debug, Clone)]
pub struct Acceptor<T> {
    context_path: String,
    target: T,
}

impl<T> Acceptor<T> {
    pub fn context_path(&self) -> &str {
        &self.context_path
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Path below the context path, `None` when the path is outside it
    fn path_info(&self, path: &str) -> Option<String> {
        if self.context_path == "/" {
            return Some(path.to_string());
        }
        let rest = path.strip_prefix(&self.context_path)?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

/// Acceptors ordered from the most to the least specific context path
#[derive(Debug, Clone)]
pub struct AcceptorResolver<T> {
    acceptors: Vec<Acceptor<T>>,
}

impl<T> Default for AcceptorResolver<T> {
    fn default() -> Self {
        Self {
            acceptors: Vec::new(),
        }
    }
}

impl<T> AcceptorResolver<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context path; two APIs cannot share one
    pub fn register(&mut self, context_path: &str, target: T) -> GatewayResult<()> {
        let context_path = normalize(context_path);
        if self.acceptors.iter().any(|a| a.context_path == context_path) {
            return Err(GatewayError::config(format!(
                "context path '{}' is already in use",
                context_path
            )));
        }
        self.acceptors.push(Acceptor {
            context_path,
            target,
        });
        self.acceptors
            .sort_by(|a, b| b.context_path.len().cmp(&a.context_path.len()));
        Ok(())
    }

    /// Owning acceptor and the path below its context path
    pub fn resolve(&self, path: &str) -> Option<(&Acceptor<T>, String)> {
        let path = normalize(path);
        self.acceptors
            .iter()
            .find_map(|acceptor| acceptor.path_info(&path).map(|info| (acceptor, info)))
    }

    pub fn len(&self) -> usize {
        self.acceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Acceptor<T>> {
        self.acceptors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(paths: &[&str]) -> AcceptorResolver<String> {
        let mut resolver = AcceptorResolver::new();
        for path in paths {
            resolver.register(path, path.to_string()).unwrap();
        }
        resolver
    }

    #[test]
    fn test_longest_context_path_wins() {
        let r = resolver(&["/api", "/api/v2", "/"]);

        let (acceptor, info) = r.resolve("/api/v2/orders").unwrap();
        assert_eq!(acceptor.target(), "/api/v2");
        assert_eq!(info, "/orders");

        let (acceptor, info) = r.resolve("/api/v1/orders").unwrap();
        assert_eq!(acceptor.target(), "/api");
        assert_eq!(info, "/v1/orders");

        let (acceptor, info) = r.resolve("/health").unwrap();
        assert_eq!(acceptor.target(), "/");
        assert_eq!(info, "/health");
    }

    #[test]
    fn test_segment_boundary() {
        let r = resolver(&["/api"]);
        assert!(r.resolve("/apiary").is_none());
        assert_eq!(r.resolve("/api").unwrap().1, "/");
        assert_eq!(r.resolve("/api/").unwrap().1, "/");
    }

    #[test]
    fn test_duplicate_context_path_rejected() {
        let mut r = resolver(&["/api"]);
        assert!(r.register("/api/", "other".to_string()).is_err());
        assert_eq!(r.len(), 1);
    }
}
