//! # Flow Gateway - Core Library Crate
//!
//! The request reactor of an API gateway. Each deployed API listens on a
//! context path and declares flows, plans and endpoint groups; every request
//! runs through platform, plan and API flows around one backend invocation.
//!
//! ## Request Lifecycle
//!
//! 1. The server hands the request to the [`gateway::Reactor`]
//! 2. The API owning the path is resolved from the current deployment
//! 3. Flows are resolved per scope, narrowed by their conditions and executed
//! 4. An endpoint is picked by weighted round robin and invoked
//! 5. Response flows run, then post-processors add the shutdown signal
//!
//! Bodies travel as [`proxy::BufferFlow`]s, buffered or streamed depending on
//! the API and on what its flows need.

/// Errors, configuration, API definitions and per-request state
pub mod core;

/// Flow resolution, condition filtering and flow execution
pub mod flow;

/// API registry, backend invoker, request reactor and HTTP server
pub mod gateway;

/// Weighted endpoint selection and endpoint groups
pub mod load_balancing;

/// Request and response processors around the flows
pub mod middleware;

/// Logging and metrics setup
pub mod observability;

/// Body transport and backend connections
pub mod proxy;

/// Context path acceptors and flow selectors
pub mod routing;

/// Node lifecycle and connection shutdown signalling
pub mod traffic;

pub use core::config::{ConfigManager, GatewayConfig};
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::{ApiRegistry, GatewayServer, Reactor};
pub use traffic::{NodeLifecycle, NodeState};
