// src/config.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default buckets for the high-resolution latency histogram. Fine-grained
/// because the series carries no per-request labels.
pub const DEFAULT_LATENCY_HIGHR_BUCKETS: [f64; 21] = [
    0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0,
    7.5, 10.0, 30.0, 60.0,
];

/// Default buckets for the low-resolution, handler-labeled latency
/// histogram. Coarse because every label combination multiplies the bucket
/// cost.
pub const DEFAULT_LATENCY_LOWR_BUCKETS: [f64; 3] = [0.1, 0.5, 1.0];

/// Environment variable overriding [`DEFAULT_LATENCY_HIGHR_BUCKETS`] as a
/// JSON array, honored by [`Config::from_env`].
pub const LATENCY_HIGHR_BUCKETS_ENV_VAR: &str = "INSTRUMENTATOR_LATENCY_HIGHR_BUCKETS";

/// Environment variable overriding [`DEFAULT_LATENCY_LOWR_BUCKETS`] as a
/// JSON array, honored by [`Config::from_env`].
pub const LATENCY_LOWR_BUCKETS_ENV_VAR: &str = "INSTRUMENTATOR_LATENCY_LOWR_BUCKETS";

/// Instrumentation options.
///
/// Every field has a default, so a partial deserialization (or
/// `Config::default()`) yields a working configuration.
#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Group status codes into `2xx`, `3xx` and so on.
    #[serde(default = "default_true")]
    pub should_group_status_codes: bool,

    /// Skip instrumentation entirely for requests without a matching route
    /// template.
    #[serde(default)]
    pub should_ignore_untemplated: bool,

    /// Group requests without a matching route template under the handler
    /// label `none`.
    #[serde(default = "default_true")]
    pub should_group_untemplated: bool,

    /// Round recorded latencies to `round_latency_decimals` decimals.
    #[serde(default)]
    pub should_round_latency_decimals: bool,

    /// Number of decimals latencies are rounded to. Ignored unless
    /// `should_round_latency_decimals` is on.
    #[serde(default = "default_round_latency_decimals")]
    pub round_latency_decimals: u32,

    /// Make `instrument` and `expose` no-ops unless `env_var_name` is set
    /// truthy at the time they are called.
    #[serde(default)]
    pub should_respect_env_var: bool,

    /// Environment variable checked by the gate.
    #[serde(default = "default_env_var_name")]
    pub env_var_name: String,

    /// Track requests currently being handled in a gauge.
    #[serde(default)]
    pub should_instrument_requests_inprogress: bool,

    /// Name of the in-progress gauge.
    #[serde(default = "default_inprogress_name")]
    pub inprogress_name: String,

    /// Label the in-progress gauge by method and handler instead of keeping
    /// it unlabeled.
    #[serde(default)]
    pub inprogress_labels: bool,

    /// Force the method label to the `ignored` sentinel, bounding label
    /// cardinality when methods do not matter.
    #[serde(default)]
    pub should_ignore_method: bool,

    /// Patterns (substring-searched regexes) for handlers that are skipped
    /// by instrumentation.
    #[serde(default)]
    pub excluded_handlers: Vec<String>,

    /// Patterns for handlers whose response bodies are captured into the
    /// observation record.
    #[serde(default)]
    pub body_handlers: Vec<String>,

    /// Namespace prepended to every default metric name.
    #[serde(default)]
    pub metric_namespace: String,

    /// Subsystem prepended to every default metric name.
    #[serde(default)]
    pub metric_subsystem: String,

    /// Buckets for the high-resolution latency histogram.
    #[serde(default = "default_latency_highr_buckets")]
    pub latency_highr_buckets: Vec<f64>,

    /// Buckets for the low-resolution latency histogram.
    #[serde(default = "default_latency_lowr_buckets")]
    pub latency_lowr_buckets: Vec<f64>,

    /// Only record responses with `2xx` status in the high-resolution
    /// histogram.
    #[serde(default)]
    pub should_only_respect_2xx_for_highr: bool,

    /// Record the duration up to the first response byte instead of the
    /// full duration including body streaming.
    #[serde(default)]
    pub should_exclude_streaming_duration: bool,

    /// Static label name/value pairs appended to every default series.
    #[serde(default)]
    pub custom_labels: BTreeMap<String, String>,

    /// Path the exposition endpoint is served on.
    #[serde(default = "default_metrics_endpoint")]
    pub metrics_endpoint: String,

    /// Gzip the exposition payload when the scraper accepts it.
    #[serde(default)]
    pub should_gzip: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            should_group_status_codes: true,
            should_ignore_untemplated: false,
            should_group_untemplated: true,
            should_round_latency_decimals: false,
            round_latency_decimals: default_round_latency_decimals(),
            should_respect_env_var: false,
            env_var_name: default_env_var_name(),
            should_instrument_requests_inprogress: false,
            inprogress_name: default_inprogress_name(),
            inprogress_labels: false,
            should_ignore_method: false,
            excluded_handlers: Vec::new(),
            body_handlers: Vec::new(),
            metric_namespace: String::new(),
            metric_subsystem: String::new(),
            latency_highr_buckets: default_latency_highr_buckets(),
            latency_lowr_buckets: default_latency_lowr_buckets(),
            should_only_respect_2xx_for_highr: false,
            should_exclude_streaming_duration: false,
            custom_labels: BTreeMap::new(),
            metrics_endpoint: default_metrics_endpoint(),
            should_gzip: false,
        }
    }
}

impl Config {
    /// Default configuration with the bucket overrides from
    /// [`LATENCY_HIGHR_BUCKETS_ENV_VAR`] and [`LATENCY_LOWR_BUCKETS_ENV_VAR`]
    /// applied. A variable holding anything but a JSON array of numbers is a
    /// configuration error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(buckets) = buckets_from_env(LATENCY_HIGHR_BUCKETS_ENV_VAR)? {
            config.latency_highr_buckets = buckets;
        }
        if let Some(buckets) = buckets_from_env(LATENCY_LOWR_BUCKETS_ENV_VAR)? {
            config.latency_lowr_buckets = buckets;
        }
        Ok(config)
    }

    /// Validate option combinations that cannot be expressed in the type
    /// system. Called at instrumentator construction, never at request time.
    pub fn validate(&self) -> Result<()> {
        if self.round_latency_decimals > 17 {
            return Err(Error::config(format!(
                "round_latency_decimals must be at most 17, got {}",
                self.round_latency_decimals
            )));
        }
        if !self.metrics_endpoint.starts_with('/') {
            return Err(Error::config(format!(
                "metrics_endpoint must start with '/', got '{}'",
                self.metrics_endpoint
            )));
        }
        validate_buckets("latency_highr_buckets", &self.latency_highr_buckets)?;
        validate_buckets("latency_lowr_buckets", &self.latency_lowr_buckets)?;
        Ok(())
    }
}

fn validate_buckets(name: &str, buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        return Err(Error::config(format!("{name} must not be empty")));
    }
    for window in buckets.windows(2) {
        if window[0] >= window[1] {
            return Err(Error::config(format!(
                "{name} must be strictly increasing, got {} before {}",
                window[0], window[1]
            )));
        }
    }
    Ok(())
}

fn buckets_from_env(var: &str) -> Result<Option<Vec<f64>>> {
    match std::env::var(var) {
        Ok(raw) => {
            let buckets: Vec<f64> = serde_json::from_str(&raw).map_err(|e| {
                Error::config(format!("{var} must be a JSON array of numbers: {e}"))
            })?;
            Ok(Some(buckets))
        }
        Err(_) => Ok(None),
    }
}

fn default_true() -> bool {
    true
}

fn default_round_latency_decimals() -> u32 {
    4
}

fn default_env_var_name() -> String {
    "ENABLE_METRICS".to_string()
}

fn default_inprogress_name() -> String {
    "http_requests_inprogress".to_string()
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

fn default_latency_highr_buckets() -> Vec<f64> {
    DEFAULT_LATENCY_HIGHR_BUCKETS.to_vec()
}

fn default_latency_lowr_buckets() -> Vec<f64> {
    DEFAULT_LATENCY_LOWR_BUCKETS.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_overrides_replace_default_buckets() {
        std::env::set_var(LATENCY_HIGHR_BUCKETS_ENV_VAR, "[0.1, 1, 10]");
        let config = Config::from_env().unwrap();
        assert_eq!(config.latency_highr_buckets, vec![0.1, 1.0, 10.0]);
        assert_eq!(
            config.latency_lowr_buckets,
            DEFAULT_LATENCY_LOWR_BUCKETS.to_vec()
        );
        std::env::remove_var(LATENCY_HIGHR_BUCKETS_ENV_VAR);
    }

    #[test]
    #[serial]
    fn malformed_env_override_is_a_config_error() {
        std::env::set_var(LATENCY_LOWR_BUCKETS_ENV_VAR, "not json");
        let result = Config::from_env();
        assert!(matches!(result, Err(Error::Config { .. })));
        std::env::remove_var(LATENCY_LOWR_BUCKETS_ENV_VAR);
    }

    #[test]
    fn partial_deserialization_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"excluded_handlers": ["/metrics"]}"#).unwrap();
        assert!(config.should_group_status_codes);
        assert_eq!(config.excluded_handlers, vec!["/metrics".to_string()]);
        assert_eq!(config.metrics_endpoint, "/metrics");
    }

    #[test]
    fn rejects_excessive_rounding_precision() {
        let config = Config {
            round_latency_decimals: 42,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn rejects_unsorted_buckets() {
        let config = Config {
            latency_lowr_buckets: vec![0.5, 0.1, 1.0],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn rejects_empty_buckets() {
        let config = Config {
            latency_highr_buckets: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn rejects_relative_endpoint() {
        let config = Config {
            metrics_endpoint: "metrics".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }
}
