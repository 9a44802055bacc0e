pub mod metrics_registry;

pub use metrics_registry::MetricsRegistry;
