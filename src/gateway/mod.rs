//! # Gateway Module
//!
//! Ties the other modules together:
//! - [`registry`] holds the deployed APIs
//! - [`invoker`] calls the selected backend endpoint
//! - [`reactor`] runs one request through processors, flows and the backend
//! - [`server`] exposes the reactor over HTTP

pub mod invoker;
pub mod reactor;
pub mod registry;
pub mod server;

pub use invoker::Invoker;
pub use reactor::{Exchange, Reactor, ReactorSettings};
pub use registry::{ApiRegistry, DeployedApi, DeploymentReport, RegistrySnapshot};
pub use server::GatewayServer;
