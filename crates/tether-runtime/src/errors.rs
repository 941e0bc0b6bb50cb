//! Runtime error types.

use std::sync::Arc;

use tether_docs::DocError;

/// Errors raised by slots, orchestrators, and the workspace manager.
///
/// `Clone` because a slot's initialization result is shared by every
/// caller awaiting it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RuntimeError {
    /// No slot with this id in the workspace.
    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    /// No open workspace with this id or path.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// The session runtime failed to start.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The session runtime rejected or failed an operation.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The operation is not valid in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Process or filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Plan or job document failure.
    #[error(transparent)]
    Docs(Arc<DocError>),

    /// Internal / unexpected error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DocError> for RuntimeError {
    fn from(e: DocError) -> Self {
        Self::Docs(Arc::new(e))
    }
}

impl RuntimeError {
    /// Whether the caller may retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Runtime(_) | Self::Io(_) => true,
            Self::Docs(e) => e.is_transient(),
            Self::SlotNotFound(_)
            | Self::WorkspaceNotFound(_)
            | Self::Initialization(_)
            | Self::InvalidOperation(_)
            | Self::Internal(_) => false,
        }
    }

    /// Error category string for logs and metrics.
    pub fn category(&self) -> &str {
        match self {
            Self::SlotNotFound(_) => "slot_not_found",
            Self::WorkspaceNotFound(_) => "workspace_not_found",
            Self::Initialization(_) => "initialization",
            Self::Runtime(_) => "runtime",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Io(_) => "io",
            Self::Docs(_) => "docs",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
