//! Crate-level error type for the fallible entry points.
//!
//! Per-sample and per-record rejections on the hot path are not represented
//! here: they are expected steady-state occurrences and are logged and
//! dropped in place rather than propagated as `Result`.

use std::path::PathBuf;

/// Errors surfaced by state persistence and configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The state file could not be read or written.
    #[error("state file io error at {}: {source}", path.display())]
    Io {
        /// Path of the state file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The state file contents could not be parsed as the expected record format.
    #[error("state file parse error: {0}")]
    Parse(String),

    /// A config file could not be read or deserialized.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience alias for the crate's fallible operations.
pub type Result<T> = std::result::Result<T, ComputeError>;
