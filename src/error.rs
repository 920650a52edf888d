//! Error types for os-health-agent.

use std::path::Path;
use thiserror::Error;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the agent and its self-update pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Metadata fetch or download failed (timeouts included).
    #[error("network error: {0}")]
    Network(String),

    /// A version tag or release document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// The downloaded archive is corrupt, truncated or unreadable.
    #[error("archive error: {0}")]
    Archive(String),

    /// The extracted archive does not contain the payload marker or a tracked file.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// Permission, space or I/O failure before any live file was touched.
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// The installer failed after it had already replaced live files.
    #[error("partial install: replaced {replaced} of {total} files: {reason}")]
    PartialInstall {
        /// Number of live files already replaced.
        replaced: usize,
        /// Number of files the install had to write.
        total: usize,
        /// What went wrong.
        reason: String,
    },

    /// Restoring a snapshot failed.
    #[error("rollback error: {0}")]
    Rollback(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The process could not be restarted in place.
    #[error("restart error: {0}")]
    Restart(String),

    /// Raw I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::Filesystem`] carrying the path that failed.
    pub(crate) fn fs(action: &str, path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Filesystem(format!("{action} {}: {err}", path.display()))
    }

    /// Whether this failure left live installation files modified.
    ///
    /// Only a partial install mutates the live tree; every other failure is
    /// raised before the first rename.
    #[must_use]
    pub fn mutated_live_install(&self) -> bool {
        matches!(self, Self::PartialInstall { replaced, .. } if *replaced > 0)
    }

    /// Whether the failure is expected to clear up on the next interval.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}
