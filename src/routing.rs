// src/routing.rs

//! Declaration-ordered route table used to resolve a request to its route
//! template. Templates use axum's path syntax: `:name` captures a single
//! segment, a trailing `*rest` captures the remainder.
//!
//! Resolution walks the table top to bottom and returns the first route
//! whose path *and* method both match. A route whose path matches but whose
//! method does not is skipped, not reported. Mounted sub-tables resolve
//! against their own entries and prepend the mount prefix, so the handler
//! identity is always relative to the table the middleware was built with.

use http::Method;

/// One parsed template segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    Wildcard,
}

/// A parsed path template together with its original text form.
#[derive(Debug, Clone)]
struct PathTemplate {
    text: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let segments = split_path(template)
            .map(|segment| {
                if segment.starts_with(':') {
                    Segment::Param
                } else if segment.starts_with('*') {
                    Segment::Wildcard
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();
        Self {
            text: template.to_string(),
            segments,
        }
    }

    fn matches(&self, path_segments: &[&str]) -> bool {
        let mut remaining = path_segments;
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard => {
                    // A wildcard must be the last template segment and must
                    // consume at least one path segment.
                    return index == self.segments.len() - 1 && !remaining.is_empty();
                }
                Segment::Param => match remaining.split_first() {
                    Some((_, rest)) => remaining = rest,
                    None => return false,
                },
                Segment::Literal(literal) => match remaining.split_first() {
                    Some((head, rest)) if *head == literal => remaining = rest,
                    _ => return false,
                },
            }
        }
        remaining.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Route {
        template: PathTemplate,
        // Empty means any method.
        methods: Vec<Method>,
    },
    Mount {
        prefix: PathTemplate,
        table: RouteTable,
    },
}

/// Ordered route table of an instrumented application.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<Entry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route restricted to the given methods.
    pub fn route(mut self, template: &str, methods: impl IntoIterator<Item = Method>) -> Self {
        self.entries.push(Entry::Route {
            template: PathTemplate::parse(template),
            methods: methods.into_iter().collect(),
        });
        self
    }

    /// Add a route matching any method.
    pub fn any(mut self, template: &str) -> Self {
        self.entries.push(Entry::Route {
            template: PathTemplate::parse(template),
            methods: Vec::new(),
        });
        self
    }

    /// Mount a nested table under a literal path prefix.
    pub fn mount(mut self, prefix: &str, table: RouteTable) -> Self {
        self.entries.push(Entry::Mount {
            prefix: PathTemplate::parse(prefix),
            table,
        });
        self
    }

    /// Resolve a request to its route template.
    ///
    /// Returns the first full match in declaration order, or `None` when no
    /// route accepts both the path and the method.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<String> {
        let segments: Vec<&str> = split_path(path).collect();
        self.resolve_segments(method, &segments)
    }

    fn resolve_segments(&self, method: &Method, path_segments: &[&str]) -> Option<String> {
        for entry in &self.entries {
            match entry {
                Entry::Route { template, methods } => {
                    if !template.matches(path_segments) {
                        continue;
                    }
                    if methods.is_empty() || methods.contains(method) {
                        return Some(template.text.clone());
                    }
                    // Partial match: path accepted, method rejected.
                }
                Entry::Mount { prefix, table } => {
                    let prefix_len = prefix.segments.len();
                    if path_segments.len() < prefix_len {
                        continue;
                    }
                    if !prefix.matches(&path_segments[..prefix_len]) {
                        continue;
                    }
                    if let Some(inner) = table.resolve_segments(method, &path_segments[prefix_len..])
                    {
                        return Some(format!("{}{}", prefix.text, inner));
                    }
                    // No inner match: keep walking the outer table.
                }
            }
        }
        None
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new()
            .route("/", [Method::GET])
            .route("/users/:id", [Method::GET, Method::DELETE])
            .route("/users/:id", [Method::PATCH])
            .any("/assets/*path")
    }

    #[test]
    fn resolves_literal_and_templated_routes() {
        let table = table();
        assert_eq!(table.resolve(&Method::GET, "/"), Some("/".to_string()));
        assert_eq!(
            table.resolve(&Method::GET, "/users/42"),
            Some("/users/:id".to_string())
        );
        assert_eq!(
            table.resolve(&Method::GET, "/assets/css/site.css"),
            Some("/assets/*path".to_string())
        );
    }

    #[test]
    fn unknown_path_resolves_to_none() {
        assert_eq!(table().resolve(&Method::GET, "/does_not_exist"), None);
    }

    #[test]
    fn partial_match_is_skipped() {
        let table = table();
        // Path matches the first /users/:id entry, but only PATCH on the
        // second entry accepts the method.
        assert_eq!(
            table.resolve(&Method::PATCH, "/users/42"),
            Some("/users/:id".to_string())
        );
        // No entry at all accepts POST for this path.
        assert_eq!(table.resolve(&Method::POST, "/users/42"), None);
    }

    #[test]
    fn first_full_match_wins() {
        let table = RouteTable::new()
            .route("/items/:id", [Method::GET])
            .route("/items/special", [Method::GET]);
        assert_eq!(
            table.resolve(&Method::GET, "/items/special"),
            Some("/items/:id".to_string())
        );
    }

    #[test]
    fn mounted_table_prepends_prefix() {
        let api = RouteTable::new().route("/users/:id", [Method::GET]);
        let root = RouteTable::new()
            .route("/health", [Method::GET])
            .mount("/api", api.clone());

        assert_eq!(
            root.resolve(&Method::GET, "/api/users/7"),
            Some("/api/users/:id".to_string())
        );
        // The sub-table on its own resolves without the mount prefix.
        assert_eq!(
            api.resolve(&Method::GET, "/users/7"),
            Some("/users/:id".to_string())
        );
    }

    #[test]
    fn mount_without_inner_match_keeps_walking() {
        let api = RouteTable::new().route("/users/:id", [Method::GET]);
        let root = RouteTable::new()
            .mount("/api", api)
            .any("/api/*rest");
        assert_eq!(
            root.resolve(&Method::GET, "/api/other"),
            Some("/api/*rest".to_string())
        );
    }

    #[test]
    fn wildcard_requires_at_least_one_segment() {
        let table = RouteTable::new().any("/assets/*path");
        assert_eq!(table.resolve(&Method::GET, "/assets"), None);
        assert_eq!(
            table.resolve(&Method::GET, "/assets/app.js"),
            Some("/assets/*path".to_string())
        );
    }
}
