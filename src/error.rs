// src/error.rs

use thiserror::Error;

/// Errors produced while configuring, attaching, or exposing instrumentation.
///
/// Downstream application errors are never wrapped in this type. The
/// middleware re-raises them as the inner service's own error after metric
/// emission.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration detected at construction or attachment time.
    #[error("invalid instrumentation configuration: {message}")]
    Config { message: String },

    /// Metric registration failed for a reason other than the series
    /// already existing. Duplicate registration is handled before this
    /// error is ever raised.
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    /// A metric collector rejected an observation.
    #[error("metric collector '{name}' failed: {message}")]
    Collector { name: String, message: String },

    /// Rendering the text exposition failed.
    #[error("failed to render metrics exposition: {message}")]
    Exposition { message: String },

    /// Reading worker-local metric files in multiprocess mode failed.
    #[error("multiprocess {operation} failed: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new collector error.
    pub fn collector(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collector {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a new exposition error.
    pub fn exposition(message: impl Into<String>) -> Self {
        Self::Exposition {
            message: message.into(),
        }
    }

    /// Create a new IO error with the failed operation attached.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }
}

/// Result type alias for the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
