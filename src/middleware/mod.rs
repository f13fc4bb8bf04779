//! Processors running around the flow phases.

pub mod pipeline;

pub use pipeline::{Processor, ProcessorChain, TransactionIdProcessor};
