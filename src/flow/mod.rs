//! # Flows
//!
//! Flow resolution, condition filtering and step execution.

pub mod chain;
pub mod condition;
pub mod expression;
pub mod messages;
pub mod resolver;

pub use chain::{FlowChain, Phase};
pub use condition::{ConditionFilter, ConditionScope, Conditional, ScopeSnapshot};
pub use expression::{ExpressionEngine, TeraEngine};
pub use resolver::{Flow, FlowResolver, FlowResolverFactory, Plan};
