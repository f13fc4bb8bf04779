//! Endpoint selection: weighted round robin and endpoint groups.

pub mod balancer;
pub mod group;

pub use balancer::WeightedRoundRobin;
pub use group::{Endpoint, EndpointArena, EndpointGroup, EndpointStats, EndpointTarget};
