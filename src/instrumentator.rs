// src/instrumentator.rs

use std::path::Path;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use tower_http::compression::CompressionLayer;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::HandlerFilter;
use crate::metrics::collectors::DefaultMetrics;
use crate::metrics::exporters::{self, MULTIPROC_ENV_VAR};
use crate::metrics::middleware::{InprogressGauge, MetricsLayer, Shared};
use crate::metrics::{
    default_registry, try_register, AsyncMetricFn, MetricBuilder, MetricFn, Observation,
};
use crate::routing::RouteTable;

/// Builder wiring instrumentation into axum applications.
///
/// Construction validates the configuration; the terminal steps are
/// [`instrument`](Self::instrument), which layers the request interceptor
/// onto a router, and [`expose`](Self::expose), which adds the scrape
/// endpoint. One instrumentator can be attached to any number of routers;
/// each attachment builds its collectors against the configured registry.
pub struct Instrumentator {
    config: Config,
    registry: Registry,
    routes: Option<RouteTable>,
    collectors: Vec<Box<dyn MetricBuilder>>,
    async_collectors: Vec<AsyncMetricFn>,
}

impl Instrumentator {
    /// Create an instrumentator bound to the process-wide default registry.
    ///
    /// Fails on an invalid configuration, including a set
    /// `PROMETHEUS_MULTIPROC_DIR` that does not point to a directory. These
    /// are construction-time failures by design, never deferred to request
    /// time.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        if let Ok(dir) = std::env::var(MULTIPROC_ENV_VAR) {
            if !Path::new(&dir).is_dir() {
                return Err(Error::config(format!(
                    "env var {MULTIPROC_ENV_VAR}='{dir}' is not a directory"
                )));
            }
        }
        Ok(Self {
            config,
            registry: default_registry().clone(),
            routes: None,
            collectors: Vec::new(),
            async_collectors: Vec::new(),
        })
    }

    /// Use a dedicated registry instead of the process-wide default.
    ///
    /// Distinct applications instrumented with distinct registries expose
    /// fully independent series, which is what tests and multi-tenant host
    /// processes want.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Provide the route table of the application being instrumented.
    ///
    /// The table should describe the routes of the exact router instance
    /// the middleware is attached to: a mounted sub-application instrumented
    /// directly resolves handlers without its mount prefix. Without a table
    /// the middleware falls back to the framework-provided matched path.
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Add a metric collector. When no collector is added, the bundled
    /// [`DefaultMetrics`] set is installed at attachment time.
    pub fn add(mut self, collector: impl MetricBuilder + 'static) -> Self {
        self.collectors.push(Box::new(collector));
        self
    }

    /// Add an asynchronous observation function. All asynchronous functions
    /// run concurrently per request and are awaited before the response
    /// stream completes.
    pub fn add_async<F>(mut self, observe: F) -> Self
    where
        F: Fn(Arc<Observation>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.async_collectors.push(Arc::new(observe));
        self
    }

    /// The registry collectors are built against.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Attach the request interceptor to a router.
    pub fn instrument<S>(&self, router: Router<S>) -> Result<Router<S>>
    where
        S: Clone + Send + Sync + 'static,
    {
        if !self.gate_open() {
            debug!(
                env_var = %self.config.env_var_name,
                "instrumentation gated off, router left unchanged"
            );
            return Ok(router);
        }
        let shared = self.build_shared()?;
        info!(
            collectors = shared.sync_metrics.len(),
            async_collectors = shared.async_metrics.len(),
            "attached request instrumentation"
        );
        Ok(router.layer(MetricsLayer::new(Arc::new(shared))))
    }

    /// Add the scrape endpoint to a router.
    pub fn expose<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        if !self.gate_open() {
            debug!(
                env_var = %self.config.env_var_name,
                "exposition gated off, router left unchanged"
            );
            return router;
        }
        let registry = self.registry.clone();
        let handler = move || {
            let registry = registry.clone();
            async move { exporters::metrics_response(&registry) }
        };
        let mut endpoint = get(handler);
        if self.config.should_gzip {
            endpoint = endpoint.layer(CompressionLayer::new());
        }
        info!(endpoint = %self.config.metrics_endpoint, "exposed metrics endpoint");
        router.route(&self.config.metrics_endpoint, endpoint)
    }

    fn build_shared(&self) -> Result<Shared> {
        let filter = HandlerFilter::new(
            &self.config.excluded_handlers,
            &self.config.body_handlers,
            self.config.should_ignore_untemplated,
        )?;

        let mut sync_metrics: Vec<MetricFn> = Vec::new();
        if self.collectors.is_empty() {
            let default_metrics = DefaultMetrics::new()
                .with_namespace(self.config.metric_namespace.clone())
                .with_subsystem(self.config.metric_subsystem.clone())
                .only_respect_2xx_for_highr(self.config.should_only_respect_2xx_for_highr)
                .exclude_streaming_duration(self.config.should_exclude_streaming_duration)
                .with_highr_buckets(self.config.latency_highr_buckets.clone())
                .with_lowr_buckets(self.config.latency_lowr_buckets.clone())
                .with_custom_labels(self.config.custom_labels.clone());
            if let Some(observe) = default_metrics.build(&self.registry)? {
                sync_metrics.push(observe);
            }
        } else {
            for collector in &self.collectors {
                if let Some(observe) = collector.build(&self.registry)? {
                    sync_metrics.push(observe);
                }
            }
        }

        let inprogress = if self.config.should_instrument_requests_inprogress {
            self.build_inprogress_gauge()?
        } else {
            None
        };

        Ok(Shared {
            routes: self.routes.clone(),
            filter,
            should_group_status_codes: self.config.should_group_status_codes,
            should_group_untemplated: self.config.should_group_untemplated,
            should_ignore_method: self.config.should_ignore_method,
            should_round_latency_decimals: self.config.should_round_latency_decimals,
            round_latency_decimals: self.config.round_latency_decimals,
            sync_metrics,
            async_metrics: self.async_collectors.clone(),
            inprogress,
        })
    }

    fn build_inprogress_gauge(&self) -> Result<Option<InprogressGauge>> {
        let opts = Opts::new(
            self.config.inprogress_name.clone(),
            "Number of HTTP requests in progress.",
        );
        if self.config.inprogress_labels {
            let gauge = IntGaugeVec::new(opts, &["method", "handler"])?;
            Ok(try_register(&self.registry, gauge)?.map(InprogressGauge::Labeled))
        } else {
            let gauge = IntGauge::with_opts(opts)?;
            Ok(try_register(&self.registry, gauge)?.map(InprogressGauge::Plain))
        }
    }

    /// Whether the environment gate allows attachment, checked at the time
    /// `instrument` or `expose` is called.
    fn gate_open(&self) -> bool {
        if !self.config.should_respect_env_var {
            return true;
        }
        std::env::var(&self.config.env_var_name)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn construction_rejects_invalid_multiproc_dir() {
        std::env::set_var(MULTIPROC_ENV_VAR, "/definitely/not/a/directory");
        let result = Instrumentator::new(Config::default());
        assert!(matches!(result, Err(Error::Config { .. })));
        std::env::remove_var(MULTIPROC_ENV_VAR);
    }

    #[test]
    #[serial]
    fn construction_accepts_valid_multiproc_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(MULTIPROC_ENV_VAR, dir.path());
        assert!(Instrumentator::new(Config::default()).is_ok());
        std::env::remove_var(MULTIPROC_ENV_VAR);
    }

    #[test]
    #[serial]
    fn construction_rejects_invalid_patterns() {
        let config = Config {
            excluded_handlers: vec!["[".to_string()],
            ..Config::default()
        };
        // Pattern compilation happens at attachment.
        let instrumentator = Instrumentator::new(config).unwrap();
        let result = instrumentator.instrument(Router::<()>::new());
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    #[serial]
    fn gate_blocks_attachment_until_env_var_is_truthy() {
        let config = Config {
            should_respect_env_var: true,
            env_var_name: "INSTRUMENTATOR_GATE_TEST".to_string(),
            ..Config::default()
        };
        std::env::remove_var("INSTRUMENTATOR_GATE_TEST");
        let instrumentator = Instrumentator::new(config)
            .unwrap()
            .with_registry(Registry::new());

        assert!(!instrumentator.gate_open());
        std::env::set_var("INSTRUMENTATOR_GATE_TEST", "false");
        assert!(!instrumentator.gate_open());
        std::env::set_var("INSTRUMENTATOR_GATE_TEST", "1");
        assert!(instrumentator.gate_open());
        std::env::set_var("INSTRUMENTATOR_GATE_TEST", "True");
        assert!(instrumentator.gate_open());
        std::env::remove_var("INSTRUMENTATOR_GATE_TEST");
    }
}
