// src/metrics/collectors.rs

//! Ready-to-use metric collectors. Each collector is an independently
//! configurable builder: `build` registers its series against a registry and
//! returns the observation function the middleware calls once per request.
//!
//! The size collectors record count and sum only. The exposition library
//! does not implement client-side summaries, so they are expressed as
//! histograms with a single `+Inf` bucket, which carries identical
//! count/sum semantics.

use std::collections::BTreeMap;

use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

use crate::config::{DEFAULT_LATENCY_HIGHR_BUCKETS, DEFAULT_LATENCY_LOWR_BUCKETS};
use crate::error::Result;
use crate::labels::{split_custom_labels, LabelSpec};
use crate::metrics::{ensure_inf_bucket, try_register, MetricBuilder, MetricFn, Observation};

/// Monotonic request counter, labeled by a configurable subset of handler,
/// method and status.
#[derive(Debug, Clone)]
pub struct Requests {
    metric_name: String,
    metric_doc: String,
    metric_namespace: String,
    metric_subsystem: String,
    include_handler: bool,
    include_method: bool,
    include_status: bool,
    custom_labels: BTreeMap<String, String>,
}

impl Default for Requests {
    fn default() -> Self {
        Self {
            metric_name: "http_requests_total".to_string(),
            metric_doc: "Total number of requests by method, status and handler.".to_string(),
            metric_namespace: String::new(),
            metric_subsystem: String::new(),
            include_handler: true,
            include_method: true,
            include_status: true,
            custom_labels: BTreeMap::new(),
        }
    }
}

impl Requests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metric_name = name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metric_namespace = namespace.into();
        self
    }

    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.metric_subsystem = subsystem.into();
        self
    }

    pub fn include_handler(mut self, include: bool) -> Self {
        self.include_handler = include;
        self
    }

    pub fn include_method(mut self, include: bool) -> Self {
        self.include_method = include;
        self
    }

    pub fn include_status(mut self, include: bool) -> Self {
        self.include_status = include;
        self
    }

    pub fn with_custom_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.custom_labels = labels;
        self
    }
}

impl MetricBuilder for Requests {
    fn build(&self, registry: &Registry) -> Result<Option<MetricFn>> {
        let spec = LabelSpec::new(
            self.include_handler,
            self.include_method,
            self.include_status,
            &self.custom_labels,
        );
        let opts = Opts::new(self.metric_name.clone(), self.metric_doc.clone())
            .namespace(self.metric_namespace.clone())
            .subsystem(self.metric_subsystem.clone());
        let counter = CounterVec::new(opts, &spec.label_names())?;
        let Some(counter) = try_register(registry, counter)? else {
            return Ok(None);
        };
        Ok(Some(Box::new(move |observation| {
            counter
                .with_label_values(&spec.label_values(observation))
                .inc();
            Ok(())
        })))
    }
}

/// Which content length a size collector records.
#[derive(Debug, Clone, Copy)]
enum SizeKind {
    Request,
    Response,
    Combined,
}

impl SizeKind {
    fn value(self, observation: &Observation) -> f64 {
        match self {
            SizeKind::Request => observation.request_content_length() as f64,
            SizeKind::Response => observation.response_content_length() as f64,
            SizeKind::Combined => {
                (observation.request_content_length() + observation.response_content_length())
                    as f64
            }
        }
    }
}

/// Shared configuration of the three size collectors.
#[derive(Debug, Clone)]
struct SizeOptions {
    metric_name: String,
    metric_doc: String,
    metric_namespace: String,
    metric_subsystem: String,
    include_handler: bool,
    include_method: bool,
    include_status: bool,
    custom_labels: BTreeMap<String, String>,
}

impl SizeOptions {
    fn new(name: &str, doc: &str) -> Self {
        Self {
            metric_name: name.to_string(),
            metric_doc: doc.to_string(),
            metric_namespace: String::new(),
            metric_subsystem: String::new(),
            include_handler: true,
            include_method: true,
            include_status: true,
            custom_labels: BTreeMap::new(),
        }
    }

    fn build(&self, registry: &Registry, kind: SizeKind) -> Result<Option<MetricFn>> {
        let spec = LabelSpec::new(
            self.include_handler,
            self.include_method,
            self.include_status,
            &self.custom_labels,
        );
        let opts = HistogramOpts::new(self.metric_name.clone(), self.metric_doc.clone())
            .namespace(self.metric_namespace.clone())
            .subsystem(self.metric_subsystem.clone())
            .buckets(vec![f64::INFINITY]);
        let histogram = HistogramVec::new(opts, &spec.label_names())?;
        let Some(histogram) = try_register(registry, histogram)? else {
            return Ok(None);
        };
        Ok(Some(Box::new(move |observation| {
            histogram
                .with_label_values(&spec.label_values(observation))
                .observe(kind.value(observation));
            Ok(())
        })))
    }
}

macro_rules! size_collector {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $metric_name:literal, $metric_doc:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            options: SizeOptions,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    options: SizeOptions::new($metric_name, $metric_doc),
                }
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn with_name(mut self, name: impl Into<String>) -> Self {
                self.options.metric_name = name.into();
                self
            }

            pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
                self.options.metric_namespace = namespace.into();
                self
            }

            pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
                self.options.metric_subsystem = subsystem.into();
                self
            }

            pub fn include_handler(mut self, include: bool) -> Self {
                self.options.include_handler = include;
                self
            }

            pub fn include_method(mut self, include: bool) -> Self {
                self.options.include_method = include;
                self
            }

            pub fn include_status(mut self, include: bool) -> Self {
                self.options.include_status = include;
                self
            }

            pub fn with_custom_labels(mut self, labels: BTreeMap<String, String>) -> Self {
                self.options.custom_labels = labels;
                self
            }
        }

        impl MetricBuilder for $name {
            fn build(&self, registry: &Registry) -> Result<Option<MetricFn>> {
                self.options.build(registry, $kind)
            }
        }
    };
}

size_collector!(
    /// Content length of incoming requests. A missing or malformed
    /// `Content-Length` header is recorded as `0`.
    RequestSize,
    SizeKind::Request,
    "http_request_size_bytes",
    "Content bytes of requests."
);

size_collector!(
    /// Content length of outgoing responses. A missing or malformed
    /// `Content-Length` header is recorded as `0`.
    ResponseSize,
    SizeKind::Response,
    "http_response_size_bytes",
    "Content bytes of responses."
);

size_collector!(
    /// Combined content length of requests and responses, each missing
    /// header counting as `0`.
    CombinedSize,
    SizeKind::Combined,
    "http_combined_size_bytes",
    "Content bytes of requests and responses."
);

/// Request latency histogram with configurable buckets and label subset.
#[derive(Debug, Clone)]
pub struct Latency {
    metric_name: String,
    metric_doc: String,
    metric_namespace: String,
    metric_subsystem: String,
    include_handler: bool,
    include_method: bool,
    include_status: bool,
    should_exclude_streaming_duration: bool,
    buckets: Vec<f64>,
    custom_labels: BTreeMap<String, String>,
}

impl Default for Latency {
    fn default() -> Self {
        Self {
            metric_name: "http_request_duration_seconds".to_string(),
            metric_doc: "Duration of HTTP requests in seconds".to_string(),
            metric_namespace: String::new(),
            metric_subsystem: String::new(),
            include_handler: true,
            include_method: true,
            include_status: true,
            should_exclude_streaming_duration: false,
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            custom_labels: BTreeMap::new(),
        }
    }
}

impl Latency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metric_name = name.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metric_namespace = namespace.into();
        self
    }

    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.metric_subsystem = subsystem.into();
        self
    }

    pub fn include_handler(mut self, include: bool) -> Self {
        self.include_handler = include;
        self
    }

    pub fn include_method(mut self, include: bool) -> Self {
        self.include_method = include;
        self
    }

    pub fn include_status(mut self, include: bool) -> Self {
        self.include_status = include;
        self
    }

    /// Record the duration up to the first response byte instead of the
    /// full duration including streaming.
    pub fn exclude_streaming_duration(mut self, exclude: bool) -> Self {
        self.should_exclude_streaming_duration = exclude;
        self
    }

    /// Histogram buckets. A sequence not ending in `+Inf` is extended with
    /// a final `+Inf` bucket at build time.
    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = buckets;
        self
    }

    pub fn with_custom_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.custom_labels = labels;
        self
    }
}

impl MetricBuilder for Latency {
    fn build(&self, registry: &Registry) -> Result<Option<MetricFn>> {
        let spec = LabelSpec::new(
            self.include_handler,
            self.include_method,
            self.include_status,
            &self.custom_labels,
        );
        let opts = HistogramOpts::new(self.metric_name.clone(), self.metric_doc.clone())
            .namespace(self.metric_namespace.clone())
            .subsystem(self.metric_subsystem.clone())
            .buckets(ensure_inf_bucket(self.buckets.clone()));
        let histogram = HistogramVec::new(opts, &spec.label_names())?;
        let Some(histogram) = try_register(registry, histogram)? else {
            return Ok(None);
        };
        let exclude_streaming = self.should_exclude_streaming_duration;
        Ok(Some(Box::new(move |observation| {
            let duration = if exclude_streaming {
                observation.modified_duration_without_streaming
            } else {
                observation.modified_duration
            };
            histogram
                .with_label_values(&spec.label_values(observation))
                .observe(duration);
            Ok(())
        })))
    }
}

/// The bundled default collector, covering the common monitoring surface in
/// one registration pass:
///
/// * `http_requests_total` (method, status, handler): request counter.
/// * `http_request_size_bytes` (handler): incoming content length.
/// * `http_response_size_bytes` (handler): outgoing content length.
/// * `http_request_duration_highr_seconds` (no request labels): many
///   buckets for accurate percentile estimation.
/// * `http_request_duration_seconds` (method, handler): few buckets, for
///   per-handler SLO aggregation.
///
/// Label cardinality multiplies bucket cost, which is why latency is split
/// into an unlabeled fine-grained histogram and a labeled coarse one.
#[derive(Debug, Clone)]
pub struct DefaultMetrics {
    metric_namespace: String,
    metric_subsystem: String,
    should_only_respect_2xx_for_highr: bool,
    should_exclude_streaming_duration: bool,
    latency_highr_buckets: Vec<f64>,
    latency_lowr_buckets: Vec<f64>,
    custom_labels: BTreeMap<String, String>,
}

impl Default for DefaultMetrics {
    fn default() -> Self {
        Self {
            metric_namespace: String::new(),
            metric_subsystem: String::new(),
            should_only_respect_2xx_for_highr: false,
            should_exclude_streaming_duration: false,
            latency_highr_buckets: DEFAULT_LATENCY_HIGHR_BUCKETS.to_vec(),
            latency_lowr_buckets: DEFAULT_LATENCY_LOWR_BUCKETS.to_vec(),
            custom_labels: BTreeMap::new(),
        }
    }
}

impl DefaultMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metric_namespace = namespace.into();
        self
    }

    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.metric_subsystem = subsystem.into();
        self
    }

    /// Only record `2xx` responses in the high-resolution histogram.
    pub fn only_respect_2xx_for_highr(mut self, only_2xx: bool) -> Self {
        self.should_only_respect_2xx_for_highr = only_2xx;
        self
    }

    pub fn exclude_streaming_duration(mut self, exclude: bool) -> Self {
        self.should_exclude_streaming_duration = exclude;
        self
    }

    pub fn with_highr_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.latency_highr_buckets = buckets;
        self
    }

    pub fn with_lowr_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.latency_lowr_buckets = buckets;
        self
    }

    pub fn with_custom_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.custom_labels = labels;
        self
    }

    fn opts(&self, name: &str, doc: &str) -> Opts {
        Opts::new(name, doc)
            .namespace(self.metric_namespace.clone())
            .subsystem(self.metric_subsystem.clone())
    }

    fn histogram_opts(&self, name: &str, doc: &str, buckets: Vec<f64>) -> HistogramOpts {
        HistogramOpts::new(name, doc)
            .namespace(self.metric_namespace.clone())
            .subsystem(self.metric_subsystem.clone())
            .buckets(buckets)
    }
}

impl MetricBuilder for DefaultMetrics {
    fn build(&self, registry: &Registry) -> Result<Option<MetricFn>> {
        let (custom_names, custom_values) = split_custom_labels(&self.custom_labels);
        let total = CounterVec::new(
            self.opts(
                "http_requests_total",
                "Total number of requests by method, status and handler.",
            ),
            &with_custom_names(&["method", "status", "handler"], &custom_names),
        )?;
        let Some(total) = try_register(registry, total)? else {
            return Ok(None);
        };

        let in_size = HistogramVec::new(
            self.histogram_opts(
                "http_request_size_bytes",
                "Content length of incoming requests by handler. \
                 Only value of header is respected. Otherwise ignored.",
                vec![f64::INFINITY],
            ),
            &with_custom_names(&["handler"], &custom_names),
        )?;
        let Some(in_size) = try_register(registry, in_size)? else {
            return Ok(None);
        };

        let out_size = HistogramVec::new(
            self.histogram_opts(
                "http_response_size_bytes",
                "Content length of outgoing responses by handler. \
                 Only value of header is respected. Otherwise ignored.",
                vec![f64::INFINITY],
            ),
            &with_custom_names(&["handler"], &custom_names),
        )?;
        let Some(out_size) = try_register(registry, out_size)? else {
            return Ok(None);
        };

        let latency_highr = HistogramVec::new(
            self.histogram_opts(
                "http_request_duration_highr_seconds",
                "Latency with many buckets but no API specific labels. \
                 Made for more accurate percentile calculations.",
                ensure_inf_bucket(self.latency_highr_buckets.clone()),
            ),
            &with_custom_names(&[], &custom_names),
        )?;
        let Some(latency_highr) = try_register(registry, latency_highr)? else {
            return Ok(None);
        };

        let latency_lowr = HistogramVec::new(
            self.histogram_opts(
                "http_request_duration_seconds",
                "Latency with only few buckets by handler. \
                 Made to be only used if aggregation by handler is important.",
                ensure_inf_bucket(self.latency_lowr_buckets.clone()),
            ),
            &with_custom_names(&["method", "handler"], &custom_names),
        )?;
        let Some(latency_lowr) = try_register(registry, latency_lowr)? else {
            return Ok(None);
        };

        let only_2xx = self.should_only_respect_2xx_for_highr;
        let exclude_streaming = self.should_exclude_streaming_duration;
        Ok(Some(Box::new(move |observation| {
            let duration = if exclude_streaming {
                observation.modified_duration_without_streaming
            } else {
                observation.modified_duration
            };
            let custom: Vec<&str> = custom_values.iter().map(String::as_str).collect();

            let mut values: Vec<&str> = vec![
                &observation.method,
                &observation.modified_status,
                &observation.modified_handler,
            ];
            values.extend(&custom);
            total.with_label_values(&values).inc();

            let mut handler_values: Vec<&str> = vec![&observation.modified_handler];
            handler_values.extend(&custom);
            in_size
                .with_label_values(&handler_values)
                .observe(observation.request_content_length() as f64);
            out_size
                .with_label_values(&handler_values)
                .observe(observation.response_content_length() as f64);

            if !only_2xx || observation.modified_status.starts_with('2') {
                latency_highr.with_label_values(&custom).observe(duration);
            }

            let mut lowr_values: Vec<&str> =
                vec![&observation.method, &observation.modified_handler];
            lowr_values.extend(&custom);
            latency_lowr.with_label_values(&lowr_values).observe(duration);
            Ok(())
        })))
    }
}

/// Append the custom label names to a fixed base label set.
fn with_custom_names<'a>(base: &[&'a str], custom_names: &'a [String]) -> Vec<&'a str> {
    base.iter()
        .copied()
        .chain(custom_names.iter().map(String::as_str))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use http::HeaderMap;

    use crate::metrics::ObservedResponse;

    fn observation(status: u16, modified_status: &str) -> Observation {
        Observation {
            method: "GET".to_string(),
            raw_status: status,
            modified_status: modified_status.to_string(),
            raw_handler: "/".to_string(),
            is_templated: true,
            modified_handler: "/".to_string(),
            modified_duration: 0.25,
            modified_duration_without_streaming: 0.1,
            request_headers: HeaderMap::new(),
            response: Some(ObservedResponse {
                status,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            }),
        }
    }

    fn family_sample_count(registry: &Registry, name: &str) -> u64 {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|metric| {
                        if metric.has_histogram() {
                            metric.get_histogram().get_sample_count()
                        } else {
                            metric.get_counter().get_value() as u64
                        }
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    #[test]
    fn requests_counter_increments_per_observation() {
        let registry = Registry::new();
        let observe = Requests::new().build(&registry).unwrap().unwrap();
        observe(&observation(200, "2xx")).unwrap();
        observe(&observation(200, "2xx")).unwrap();
        assert_eq!(family_sample_count(&registry, "http_requests_total"), 2);
    }

    #[test]
    fn duplicate_build_returns_none() {
        let registry = Registry::new();
        assert!(Requests::new().build(&registry).unwrap().is_some());
        assert!(Requests::new().build(&registry).unwrap().is_none());
    }

    #[test]
    fn distinct_registries_build_independently() {
        let first = Registry::new();
        let second = Registry::new();
        assert!(DefaultMetrics::new().build(&first).unwrap().is_some());
        assert!(DefaultMetrics::new().build(&second).unwrap().is_some());
    }

    #[test]
    fn size_collector_records_zero_without_content_length() {
        let registry = Registry::new();
        let observe = RequestSize::new().build(&registry).unwrap().unwrap();
        observe(&observation(200, "2xx")).unwrap();

        let family = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "http_request_size_bytes")
            .unwrap();
        let histogram = family.get_metric()[0].get_histogram();
        assert_eq!(histogram.get_sample_count(), 1);
        assert_eq!(histogram.get_sample_sum(), 0.0);
    }

    #[test]
    fn highr_histogram_respects_2xx_restriction() {
        let registry = Registry::new();
        let observe = DefaultMetrics::new()
            .only_respect_2xx_for_highr(true)
            .build(&registry)
            .unwrap()
            .unwrap();
        observe(&observation(200, "2xx")).unwrap();
        observe(&observation(500, "5xx")).unwrap();

        assert_eq!(
            family_sample_count(&registry, "http_request_duration_highr_seconds"),
            1
        );
        assert_eq!(
            family_sample_count(&registry, "http_request_duration_seconds"),
            2
        );
    }

    #[test]
    fn latency_uses_streaming_exclusion_flag() {
        let registry = Registry::new();
        let observe = Latency::new()
            .exclude_streaming_duration(true)
            .build(&registry)
            .unwrap()
            .unwrap();
        observe(&observation(200, "2xx")).unwrap();

        let family = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "http_request_duration_seconds")
            .unwrap();
        let histogram = family.get_metric()[0].get_histogram();
        assert_eq!(histogram.get_sample_sum(), 0.1);
    }

    #[test]
    fn custom_labels_are_appended_to_series() {
        let registry = Registry::new();
        let mut labels = BTreeMap::new();
        labels.insert("deployment".to_string(), "blue".to_string());
        let observe = Requests::new()
            .with_custom_labels(labels)
            .build(&registry)
            .unwrap()
            .unwrap();
        observe(&observation(200, "2xx")).unwrap();

        let family = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "http_requests_total")
            .unwrap();
        let label_names: Vec<_> = family.get_metric()[0]
            .get_label()
            .iter()
            .map(|pair| pair.get_name().to_string())
            .collect();
        assert!(label_names.contains(&"deployment".to_string()));
    }

    #[test]
    fn namespace_and_subsystem_prefix_metric_names() {
        let registry = Registry::new();
        let observe = Requests::new()
            .with_namespace("myapp")
            .with_subsystem("api")
            .build(&registry)
            .unwrap()
            .unwrap();
        observe(&observation(200, "2xx")).unwrap();
        assert_eq!(
            family_sample_count(&registry, "myapp_api_http_requests_total"),
            1
        );
    }
}
