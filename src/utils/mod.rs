//! # Utility Modules
//!
//! Supporting utilities shared across the protocol core.
//!
//! ## Components
//! - **Metrics**: Thread-safe observability counters

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
