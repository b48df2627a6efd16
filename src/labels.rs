// src/labels.rs

//! Label policy: pure functions that turn raw request facts into the label
//! values metrics are keyed by. No state, no side effects.

use std::collections::BTreeMap;

use crate::metrics::Observation;

/// Sentinel handler label for requests that did not match any route template.
pub const UNTEMPLATED_HANDLER: &str = "none";

/// Sentinel method label used when method cardinality is bounded away.
pub const IGNORED_METHOD: &str = "ignored";

/// Status label after the grouping policy.
///
/// With grouping on, `404` becomes `"4xx"`; otherwise the three-digit code
/// is kept as-is.
pub fn status_label(status: u16, should_group: bool) -> String {
    if should_group {
        format!("{}xx", status / 100)
    } else {
        status.to_string()
    }
}

/// Handler label after the untemplated-grouping policy.
pub fn handler_label(handler: &str, is_templated: bool, should_group_untemplated: bool) -> String {
    if !is_templated && should_group_untemplated {
        UNTEMPLATED_HANDLER.to_string()
    } else {
        handler.to_string()
    }
}

/// Method label, optionally forced to the `"ignored"` sentinel.
pub fn method_label(method: &str, should_ignore_method: bool) -> String {
    if should_ignore_method {
        IGNORED_METHOD.to_string()
    } else {
        method.to_string()
    }
}

/// Round a duration in seconds to `decimals` decimal places.
pub fn round_duration(seconds: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (seconds * factor).round() / factor
}

/// A label that collectors may include, each backed by a typed accessor on
/// the observation record instead of runtime field lookup by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelName {
    Handler,
    Method,
    Status,
}

impl LabelName {
    /// The exposition label name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelName::Handler => "handler",
            LabelName::Method => "method",
            LabelName::Status => "status",
        }
    }

    /// The label value for a completed request.
    pub fn value<'a>(&self, observation: &'a Observation) -> &'a str {
        match self {
            LabelName::Handler => &observation.modified_handler,
            LabelName::Method => &observation.method,
            LabelName::Status => &observation.modified_status,
        }
    }
}

/// An ordered label subset fixed at collector construction time, plus any
/// static custom labels appended to every series and observation.
#[derive(Debug, Clone)]
pub(crate) struct LabelSpec {
    names: Vec<LabelName>,
    custom_names: Vec<String>,
    custom_values: Vec<String>,
}

impl LabelSpec {
    /// Build the subset in the fixed order handler, method, status.
    pub(crate) fn new(
        include_handler: bool,
        include_method: bool,
        include_status: bool,
        custom_labels: &BTreeMap<String, String>,
    ) -> Self {
        let mut names = Vec::new();
        if include_handler {
            names.push(LabelName::Handler);
        }
        if include_method {
            names.push(LabelName::Method);
        }
        if include_status {
            names.push(LabelName::Status);
        }
        let (custom_names, custom_values) = split_custom_labels(custom_labels);
        Self {
            names,
            custom_names,
            custom_values,
        }
    }

    /// Label names for series registration.
    pub(crate) fn label_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.iter().map(LabelName::as_str).collect();
        names.extend(self.custom_names.iter().map(String::as_str));
        names
    }

    /// Label values for one observation, in registration order.
    pub(crate) fn label_values<'a>(&'a self, observation: &'a Observation) -> Vec<&'a str> {
        self.names
            .iter()
            .map(|name| name.value(observation))
            .chain(self.custom_values.iter().map(String::as_str))
            .collect()
    }
}

/// Split a custom label mapping into parallel name/value vectors with a
/// deterministic order.
pub(crate) fn split_custom_labels(
    custom_labels: &BTreeMap<String, String>,
) -> (Vec<String>, Vec<String>) {
    let names = custom_labels.keys().cloned().collect();
    let values = custom_labels.values().cloned().collect();
    (names, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, true, "2xx")]
    #[case(404, true, "4xx")]
    #[case(500, true, "5xx")]
    #[case(301, true, "3xx")]
    #[case(404, false, "404")]
    #[case(200, false, "200")]
    fn status_label_grouping(#[case] status: u16, #[case] group: bool, #[case] expected: &str) {
        assert_eq!(status_label(status, group), expected);
    }

    #[rstest]
    #[case("/users/:id", true, true, "/users/:id")]
    #[case("/does_not_exist", false, true, "none")]
    #[case("/does_not_exist", false, false, "/does_not_exist")]
    fn handler_label_grouping(
        #[case] handler: &str,
        #[case] templated: bool,
        #[case] group: bool,
        #[case] expected: &str,
    ) {
        assert_eq!(handler_label(handler, templated, group), expected);
    }

    #[test]
    fn method_label_sentinel() {
        assert_eq!(method_label("GET", false), "GET");
        assert_eq!(method_label("GET", true), IGNORED_METHOD);
    }

    #[rstest]
    #[case(0.123456, 4, 0.1235)]
    #[case(0.123456, 2, 0.12)]
    #[case(1.0, 4, 1.0)]
    #[case(0.00004, 4, 0.0)]
    fn duration_rounding(#[case] seconds: f64, #[case] decimals: u32, #[case] expected: f64) {
        assert!((round_duration(seconds, decimals) - expected).abs() < f64::EPSILON);
    }
}
