//! # Endpoint Groups
//!
//! An [`EndpointGroup`] owns the endpoints of one group and the weighted
//! selectors built over the ones currently available. Primary and backup
//! endpoints live in disjoint pools; backups are used only when no primary
//! is available.
//!
//! Availability changes rebuild both pools from scratch and swap them in, so
//! selection state always starts fresh for the new membership.
//! [`EndpointArena`] indexes the groups of an API by name.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::balancer::WeightedRoundRobin;
use crate::core::definition::{EndpointDefinition, EndpointGroupDefinition, MockDefinition};
use crate::core::error::{GatewayError, GatewayResult};

/// Where an endpoint sends requests
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointTarget {
    Http(Url),
    /// Answered locally without a backend
    Mock(MockDefinition),
}

/// A selectable backend endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub name: String,
    pub group: String,
    pub target: EndpointTarget,
    pub weight: i32,
    pub primary: bool,
}

impl Endpoint {
    pub fn from_definition(group: &str, definition: &EndpointDefinition) -> GatewayResult<Self> {
        let target = match definition.mock {
            Some(ref mock) => EndpointTarget::Mock(mock.clone()),
            None => EndpointTarget::Http(Url::parse(&definition.target).map_err(|e| {
                GatewayError::config(format!(
                    "endpoint '{}' has invalid target '{}': {}",
                    definition.name, definition.target, e
                ))
            })?),
        };
        Ok(Self {
            name: definition.name.clone(),
            group: group.to_string(),
            target,
            weight: definition.weight,
            primary: definition.primary,
        })
    }
}

/// Per-endpoint selection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub selections: u64,
    pub last_selected: Option<DateTime<Utc>>,
}

struct Pools {
    primary: WeightedRoundRobin<Arc<Endpoint>>,
    backup: WeightedRoundRobin<Arc<Endpoint>>,
}

impl Pools {
    fn build(endpoints: &[Arc<Endpoint>], unavailable: &HashSet<String>) -> Self {
        let available = endpoints
            .iter()
            .filter(|e| !unavailable.contains(&e.name));
        let (primary, backup): (Vec<_>, Vec<_>) = available.partition(|e| e.primary);
        Self {
            primary: WeightedRoundRobin::new(primary.into_iter().map(|e| (e.clone(), e.weight))),
            backup: WeightedRoundRobin::new(backup.into_iter().map(|e| (e.clone(), e.weight))),
        }
    }
}

/// One group of endpoints with its selection state
pub struct EndpointGroup {
    name: String,
    endpoints: Vec<Arc<Endpoint>>,
    unavailable: RwLock<HashSet<String>>,
    pools: RwLock<Arc<Pools>>,
    stats: DashMap<String, EndpointStats>,
}

impl EndpointGroup {
    pub fn from_definition(definition: &EndpointGroupDefinition) -> GatewayResult<Self> {
        let endpoints = definition
            .endpoints
            .iter()
            .map(|e| Endpoint::from_definition(&definition.name, e).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self::new(definition.name.clone(), endpoints))
    }

    pub fn new(name: String, endpoints: Vec<Arc<Endpoint>>) -> Self {
        let pools = Pools::build(&endpoints, &HashSet::new());
        Self {
            name,
            endpoints,
            unavailable: RwLock::new(HashSet::new()),
            pools: RwLock::new(Arc::new(pools)),
            stats: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Next endpoint to use, `None` when nothing is available
    pub fn next(&self) -> Option<Arc<Endpoint>> {
        let pools = self.pools.read().clone();
        let selected = pools.primary.next().or_else(|| {
            let backup = pools.backup.next();
            if backup.is_some() {
                debug!(group = %self.name, "No primary endpoint available, using backup");
            }
            backup
        });

        match selected {
            Some(endpoint) => {
                metrics::counter!(
                    "gateway_endpoint_selections_total",
                    "group" => self.name.clone(),
                    "endpoint" => endpoint.name.clone()
                )
                .increment(1);
                let mut stats = self.stats.entry(endpoint.name.clone()).or_default();
                stats.selections += 1;
                stats.last_selected = Some(Utc::now());
                Some(endpoint)
            }
            None => {
                warn!(group = %self.name, "No endpoint available");
                metrics::counter!("gateway_endpoint_unavailable_total", "group" => self.name.clone())
                    .increment(1);
                None
            }
        }
    }

    /// Mark an endpoint available or not and rebuild the selectors
    pub fn set_available(&self, endpoint: &str, available: bool) -> GatewayResult<()> {
        if !self.endpoints.iter().any(|e| e.name == endpoint) {
            return Err(GatewayError::config(format!(
                "endpoint '{}' not found in group '{}'",
                endpoint, self.name
            )));
        }

        let mut unavailable = self.unavailable.write();
        let changed = if available {
            unavailable.remove(endpoint)
        } else {
            unavailable.insert(endpoint.to_string())
        };
        if changed {
            *self.pools.write() = Arc::new(Pools::build(&self.endpoints, &unavailable));
            info!(group = %self.name, endpoint, available, "Endpoint availability changed");
        }
        Ok(())
    }

    pub fn is_available(&self, endpoint: &str) -> bool {
        !self.unavailable.read().contains(endpoint)
    }

    pub fn stats(&self) -> HashMap<String, EndpointStats> {
        self.stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Endpoint groups of one API, keyed by name
pub struct EndpointArena {
    groups: HashMap<String, Arc<EndpointGroup>>,
    default_group: Option<String>,
}

impl EndpointArena {
    pub fn build(
        definitions: &[EndpointGroupDefinition],
        default_group: Option<&str>,
    ) -> GatewayResult<Self> {
        let mut groups = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            let group = EndpointGroup::from_definition(definition)?;
            groups.insert(definition.name.clone(), Arc::new(group));
        }
        if let Some(name) = default_group {
            if !groups.contains_key(name) {
                return Err(GatewayError::config(format!(
                    "default group '{}' does not exist",
                    name
                )));
            }
        }
        Ok(Self {
            groups,
            default_group: default_group.map(str::to_string),
        })
    }

    pub fn group(&self, name: &str) -> Option<&Arc<EndpointGroup>> {
        self.groups.get(name)
    }

    pub fn default_group(&self) -> Option<&Arc<EndpointGroup>> {
        self.default_group.as_deref().and_then(|name| self.groups.get(name))
    }

    /// Requested group, falling back to the default one
    pub fn resolve(&self, requested: Option<&str>) -> GatewayResult<&Arc<EndpointGroup>> {
        match requested {
            Some(name) => self
                .group(name)
                .ok_or_else(|| GatewayError::no_endpoint(name)),
            None => self
                .default_group()
                .ok_or_else(|| GatewayError::no_endpoint("default")),
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<EndpointGroup>> {
        self.groups.values()
    }
}
