//! Document error types.

use std::path::{Path, PathBuf};

/// Errors raised by document stores.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    /// The document does not exist.
    #[error("document not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The path is not inside any configured document directory.
    #[error("path is outside the document directories: {}", .0.display())]
    OutsideRoot(PathBuf),

    /// The addressed line is not a checklist task.
    #[error("line {line} of {} is not a checklist task", path.display())]
    InvalidTask {
        /// Document path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// The document changed on disk since the caller read it.
    #[error("{} changed on disk (expected version {expected}, found {actual})", path.display())]
    Conflict {
        /// Document path.
        path: PathBuf,
        /// Version the caller based its edit on.
        expected: String,
        /// Version currently on disk.
        actual: String,
    },

    /// The requested phase change is not allowed.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Filesystem failure.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File watcher setup failed.
    #[error("watcher error: {0}")]
    Watch(String),
}

impl DocError {
    /// Wrap an I/O error, mapping `NotFound` to [`DocError::NotFound`].
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Whether retrying on the next reconciliation pass may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Conflict { .. })
    }
}

/// Result type for document operations.
pub type Result<T> = std::result::Result<T, DocError>;
