// Structured logging
pub mod logging;

// Prometheus exporter and metric descriptions
pub mod metrics;

pub use logging::init_logging;
pub use metrics::install_metrics;
