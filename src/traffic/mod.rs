//! # Traffic Module
//!
//! Node lifecycle and connection draining.
//!
//! ## Key Components
//!
//! - `NodeLifecycle`: node state plus in-flight request tracking and drain
//! - `ShutdownSignalInjector`: rewrites the `Connection` header while the node
//!   is not `STARTED`

pub mod connection_signal;
pub mod shutdown;

pub use connection_signal::ShutdownSignalInjector;
pub use shutdown::{NodeLifecycle, NodeState, RequestGuard};
