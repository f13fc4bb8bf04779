//! Request routing: API acceptors and flow selectors.

pub mod acceptor;
pub mod matcher;

pub use acceptor::{Acceptor, AcceptorResolver};
pub use matcher::{PathSelector, SelectorSet, Specificity};
