// src/lib.rs

//! Prometheus instrumentation middleware for Axum applications.
//!
//! The middleware wraps every request/response pair, resolves a normalized
//! handler identity, measures latency and payload sizes, applies the
//! configured grouping/rounding/exclusion policies, and fans an immutable
//! observation record out to a set of pluggable metric collectors bound to
//! a [`prometheus::Registry`]. A separate scrape endpoint renders the
//! registry in the text exposition format.
//!
//! # Usage
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use axum_instrumentator::{Config, Instrumentator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config {
//!         excluded_handlers: vec!["^/metrics$".to_string()],
//!         ..Config::default()
//!     };
//!     let instrumentator = Instrumentator::new(config).unwrap();
//!
//!     let app: Router = Router::new().route("/", get(|| async { "ok" }));
//!     let app = instrumentator.instrument(app).unwrap();
//!     let app = instrumentator.expose(app);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! Without further configuration this records the bundled
//! [`DefaultMetrics`](collectors::DefaultMetrics) set: a request counter, request and
//! response size observers, an unlabeled high-resolution latency histogram
//! for percentile estimation and a handler-labeled low-resolution one for
//! SLO aggregation. Individual collectors from [`collectors`] can be added
//! instead, and custom ones plugged in through the
//! [`MetricBuilder`] trait.

pub mod config;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod routing;

mod filter;
mod instrumentator;

// Re-export key types for convenience.
pub use config::Config;
pub use error::{Error, Result};
pub use instrumentator::Instrumentator;
pub use metrics::collectors;
pub use metrics::middleware::{MetricsLayer, MetricsService};
pub use metrics::{
    default_registry, AsyncMetricFn, MetricBuilder, MetricFn, Observation, ObservedResponse,
};
pub use routing::RouteTable;
