//! Core building blocks: errors, configuration, definitions and per-request state.

pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod types;
