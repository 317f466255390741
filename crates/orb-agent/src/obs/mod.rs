//! Lightweight in-process metrics.
//!
//! Metrics are stored as atomics and rendered by the `/metrics` ops handler.

pub mod metrics;

pub use metrics::AgentMetrics;
