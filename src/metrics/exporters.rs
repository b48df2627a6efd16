// src/metrics/exporters.rs

//! The scrape endpoint: renders the current registry state in the text
//! exposition format, or a fresh merge of worker-local metric files when
//! multiprocess mode is active.

use std::path::{Path, PathBuf};

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::error;

use crate::error::{Error, Result};

/// Environment variable designating the shared directory of worker-local
/// metric files. When set, every scrape merges the directory fresh instead
/// of reading the in-process registry.
pub const MULTIPROC_ENV_VAR: &str = "PROMETHEUS_MULTIPROC_DIR";

/// File extension of worker-local exposition files.
const WORKER_FILE_EXTENSION: &str = "prom";

/// Render the exposition body for one scrape.
pub fn render(registry: &Registry) -> Result<Vec<u8>> {
    if let Ok(dir) = std::env::var(MULTIPROC_ENV_VAR) {
        // The merge is rebuilt per scrape. Constructing it once and reusing
        // it would serve stale worker data.
        return merge_worker_files(Path::new(&dir));
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| Error::exposition(e.to_string()))?;
    Ok(buffer)
}

/// Concatenate all worker-local `.prom` files in `dir`, in a stable order.
fn merge_worker_files(dir: &Path) -> Result<Vec<u8>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::io(format!("directory scan of '{}'", dir.display()), e))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .map(|extension| extension == WORKER_FILE_EXTENSION)
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut buffer = Vec::new();
    for path in files {
        let contents = std::fs::read(&path)
            .map_err(|e| Error::io(format!("read of '{}'", path.display()), e))?;
        buffer.extend_from_slice(&contents);
    }
    Ok(buffer)
}

/// Build the scrape response. Failures are loud: the scrape returns an
/// error status, never an empty or stale body.
pub(crate) fn metrics_response(registry: &Registry) -> Response {
    match render(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(failure) => {
            error!(error = %failure, "metrics exposition failed");
            (StatusCode::INTERNAL_SERVER_ERROR, failure.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::IntCounter;
    use serial_test::serial;

    #[test]
    #[serial]
    fn renders_registered_series() {
        std::env::remove_var(MULTIPROC_ENV_VAR);
        let registry = Registry::new();
        let counter = IntCounter::new("render_test_total", "test counter").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let body = String::from_utf8(render(&registry).unwrap()).unwrap();
        assert!(body.contains("render_test_total 1"));
    }

    #[test]
    #[serial]
    fn multiprocess_merge_is_fresh_per_scrape() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(MULTIPROC_ENV_VAR, dir.path());

        std::fs::write(dir.path().join("worker_0.prom"), "worker_total 1\n").unwrap();
        let registry = Registry::new();
        let first = String::from_utf8(render(&registry).unwrap()).unwrap();
        assert!(first.contains("worker_total 1"));

        // A file written after the first scrape shows up in the next one.
        std::fs::write(dir.path().join("worker_1.prom"), "worker_total 2\n").unwrap();
        let second = String::from_utf8(render(&registry).unwrap()).unwrap();
        assert!(second.contains("worker_total 1"));
        assert!(second.contains("worker_total 2"));

        std::env::remove_var(MULTIPROC_ENV_VAR);
    }

    #[test]
    #[serial]
    fn multiprocess_scrape_fails_loudly_on_missing_directory() {
        std::env::set_var(MULTIPROC_ENV_VAR, "/definitely/not/a/directory");
        let registry = Registry::new();
        let result = render(&registry);
        assert!(matches!(result, Err(Error::Io { .. })));
        std::env::remove_var(MULTIPROC_ENV_VAR);
    }

    #[test]
    #[serial]
    fn non_prom_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(MULTIPROC_ENV_VAR, dir.path());

        std::fs::write(dir.path().join("worker_0.prom"), "kept_total 1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

        let registry = Registry::new();
        let body = String::from_utf8(render(&registry).unwrap()).unwrap();
        assert!(body.contains("kept_total 1"));
        assert!(!body.contains("ignored"));

        std::env::remove_var(MULTIPROC_ENV_VAR);
    }
}
