//! Error types for the experiment engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while running experiments.
///
/// Every variant is fatal: it means the measurement apparatus is broken.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(#[from] oomrace_cgroups::error::Error),

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to kill {label}: {source}")]
    Signal {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }
}
