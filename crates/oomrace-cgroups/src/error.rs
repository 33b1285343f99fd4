//! Error types for cgroup operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in cgroup operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("counter {path} holds non-numeric value {value:?}")]
    Parse { path: PathBuf, value: String },

    #[error("domain {id} still has member processes")]
    Busy { id: String },

    #[error("Cgroup setup failed: {0}")]
    Setup(String),
}

impl Error {
    /// Wrap an I/O error with the action and file it belongs to.
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// True when the error came from a counter that could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}
