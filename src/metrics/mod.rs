// src/metrics/mod.rs

//! Metric collection: the per-request observation record, the pluggable
//! collector contract, and the registration helpers shared by all
//! collectors.

pub mod collectors;
pub mod exporters;
pub mod middleware;

use std::sync::Arc;

use axum::body::Bytes;
use futures_util::future::BoxFuture;
use http::{header, HeaderMap};
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::Registry;

use crate::error::{Error, Result};

/// Process-wide default registry, used only when an instrumentator is built
/// without an explicit registry. Library internals always receive a registry
/// handle; this exists solely for the outermost composition point.
static DEFAULT_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide default registry.
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Response metadata captured by the middleware, available to collectors.
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    /// Status code as produced by the downstream application.
    pub status: u16,
    /// Response headers as sent to the client.
    pub headers: HeaderMap,
    /// Accumulated body bytes. Empty unless body capture was enabled for
    /// the handler, never partially filled.
    pub body: Bytes,
}

/// Immutable record of one completed request, produced exactly once per
/// non-excluded request and consumed by every collector.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Request method label value (raw unless the `ignored` sentinel policy
    /// is active).
    pub method: String,
    /// Status code from the downstream application, `500` when the response
    /// never started.
    pub raw_status: u16,
    /// Status label after the grouping policy.
    pub modified_status: String,
    /// Route template when resolution succeeded, else the literal request
    /// path.
    pub raw_handler: String,
    /// Whether route resolution succeeded.
    pub is_templated: bool,
    /// Handler label after the untemplated-grouping policy.
    pub modified_handler: String,
    /// Seconds from request start to response fully streamed, never
    /// negative, optionally rounded.
    pub modified_duration: f64,
    /// Seconds from request start to the first response byte, `0` when the
    /// response never started.
    pub modified_duration_without_streaming: f64,
    /// Request headers as received.
    pub request_headers: HeaderMap,
    /// Response metadata, `None` when the downstream application failed
    /// before responding.
    pub response: Option<ObservedResponse>,
}

impl Observation {
    /// The request `Content-Length`, or `0` when the header is missing or
    /// malformed.
    pub fn request_content_length(&self) -> u64 {
        content_length(&self.request_headers)
    }

    /// The response `Content-Length`, or `0` when the response never
    /// started or the header is missing or malformed.
    pub fn response_content_length(&self) -> u64 {
        self.response
            .as_ref()
            .map(|response| content_length(&response.headers))
            .unwrap_or(0)
    }
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// A synchronous collector observation function. Called once per
/// non-excluded request; must not have side effects beyond updating its
/// registered series.
pub type MetricFn = Box<dyn Fn(&Observation) -> Result<()> + Send + Sync>;

/// An asynchronous collector observation function. All asynchronous
/// collectors for one request run concurrently and are awaited before the
/// response completes.
pub type AsyncMetricFn = Arc<dyn Fn(Arc<Observation>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A metric collector bound to a registry at attachment time.
///
/// `build` registers the collector's series against `registry` and returns
/// the observation function. When an identically-named series already exists
/// in that registry (the middleware stack was rebuilt, or the same
/// configuration was attached twice), `build` returns `Ok(None)` instead of
/// failing; any other registration error propagates.
pub trait MetricBuilder: Send + Sync {
    fn build(&self, registry: &Registry) -> Result<Option<MetricFn>>;
}

/// Register `collector` against `registry`, mapping the duplicate-series
/// signal to `None`.
pub(crate) fn try_register<C>(registry: &Registry, collector: C) -> Result<Option<C>>
where
    C: Collector + Clone + 'static,
{
    match registry.register(Box::new(collector.clone())) {
        Ok(()) => Ok(Some(collector)),
        Err(prometheus::Error::AlreadyReg) => Ok(None),
        Err(e) => Err(Error::Registration(e)),
    }
}

/// Extend a bucket sequence with a final `+Inf` bucket unless it already
/// ends in one, so no value is ever unbucketed.
pub fn ensure_inf_bucket(mut buckets: Vec<f64>) -> Vec<f64> {
    match buckets.last() {
        Some(last) if last.is_infinite() && last.is_sign_positive() => buckets,
        _ => {
            buckets.push(f64::INFINITY);
            buckets
        }
    }
}
