// src/filter.rs

//! Regex predicates deciding whether a handler is instrumented at all and
//! whether its response body is captured. Patterns are matched by substring
//! search, not anchored: one rule can cover a whole path family, and callers
//! anchor with `^`/`$` themselves when they need an exact match.

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub(crate) struct HandlerFilter {
    should_ignore_untemplated: bool,
    excluded: Vec<Regex>,
    body: Vec<Regex>,
}

impl HandlerFilter {
    /// Compile the exclusion and body-capture pattern lists. A pattern that
    /// fails to compile is a configuration error, fatal at attachment time.
    pub(crate) fn new(
        excluded_patterns: &[String],
        body_patterns: &[String],
        should_ignore_untemplated: bool,
    ) -> Result<Self> {
        Ok(Self {
            should_ignore_untemplated,
            excluded: compile(excluded_patterns)?,
            body: compile(body_patterns)?,
        })
    }

    /// Whether the handler should be skipped by instrumentation entirely.
    pub(crate) fn is_excluded(&self, handler: &str, is_templated: bool) -> bool {
        if !is_templated && self.should_ignore_untemplated {
            return true;
        }
        self.excluded.iter().any(|pattern| pattern.is_match(handler))
    }

    /// Whether the response body should be accumulated for this handler.
    pub(crate) fn should_capture_body(&self, handler: &str) -> bool {
        self.body.iter().any(|pattern| pattern.is_match(handler))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .map_err(|e| Error::config(format!("invalid handler pattern '{pattern}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(excluded: &[&str], body: &[&str], ignore_untemplated: bool) -> HandlerFilter {
        let excluded: Vec<String> = excluded.iter().map(|s| s.to_string()).collect();
        let body: Vec<String> = body.iter().map(|s| s.to_string()).collect();
        HandlerFilter::new(&excluded, &body, ignore_untemplated).unwrap()
    }

    #[test]
    fn exclusion_is_substring_search() {
        let filter = filter(&["health"], &[], false);
        assert!(filter.is_excluded("/health", true));
        assert!(filter.is_excluded("/api/healthcheck", true));
        assert!(!filter.is_excluded("/users", true));
    }

    #[test]
    fn anchored_pattern_matches_exactly() {
        let filter = filter(&["^/metrics$"], &[], false);
        assert!(filter.is_excluded("/metrics", true));
        assert!(!filter.is_excluded("/metrics/extra", true));
    }

    #[test]
    fn ignore_untemplated_policy() {
        let filter = filter(&[], &[], true);
        assert!(filter.is_excluded("/unknown", false));
        assert!(!filter.is_excluded("/known/:id", true));
    }

    #[test]
    fn body_capture_is_independent_of_exclusion() {
        let filter = filter(&["/admin"], &["/download"], false);
        assert!(filter.should_capture_body("/download/:name"));
        assert!(!filter.should_capture_body("/admin"));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let patterns = vec!["[".to_string()];
        let result = HandlerFilter::new(&patterns, &[], false);
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
