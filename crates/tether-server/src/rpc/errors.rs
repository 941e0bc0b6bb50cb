//! RPC error codes and the handler error type.

use tether_docs::DocError;
use tether_runtime::RuntimeError;

use crate::rpc::types::RpcErrorBody;

/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Method not found in the registry.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Feature not configured.
pub const NOT_AVAILABLE: &str = "NOT_AVAILABLE";
/// Generic not-found.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// No open workspace with this id or path.
pub const WORKSPACE_NOT_FOUND: &str = "WORKSPACE_NOT_FOUND";
/// No slot with this id.
pub const SLOT_NOT_FOUND: &str = "SLOT_NOT_FOUND";
/// No plan or job document at this path.
pub const DOCUMENT_NOT_FOUND: &str = "DOCUMENT_NOT_FOUND";
/// Document path outside the configured directories.
pub const INVALID_PATH: &str = "INVALID_PATH";
/// Document changed since the client read it.
pub const CONFLICT: &str = "CONFLICT";
/// Session runtime failed to start.
pub const INITIALIZATION_FAILED: &str = "INITIALIZATION_FAILED";
/// Operation not valid in the current state.
pub const INVALID_OPERATION: &str = "INVALID_OPERATION";
/// Session runtime rejected the operation.
pub const RUNTIME_ERROR: &str = "RUNTIME_ERROR";

/// Error returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },

    /// Requested resource not found.
    #[error("{message}")]
    NotFound {
        /// Specific code (e.g. `SLOT_NOT_FOUND`).
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// Internal server error.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Feature not configured.
    #[error("{message}")]
    NotAvailable {
        /// Description.
        message: String,
    },

    /// Domain error with its own code.
    #[error("{message}")]
    Custom {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        details: Option<serde_json::Value>,
    },
}

impl RpcError {
    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::NotFound { code, .. } | Self::Custom { code, .. } => code,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::NotAvailable { .. } => NOT_AVAILABLE,
        }
    }

    /// Wire-format error body. Internal details stay in the logs.
    pub fn to_error_body(&self) -> RpcErrorBody {
        let message = match self {
            Self::Internal { .. } => "Internal error".to_owned(),
            other => other.to_string(),
        };
        RpcErrorBody {
            code: self.code().to_owned(),
            message,
            details: match self {
                Self::Custom { details, .. } => details.clone(),
                _ => None,
            },
        }
    }

    fn custom(code: &str, message: String) -> Self {
        Self::Custom {
            code: code.to_owned(),
            message,
            details: None,
        }
    }
}

impl From<&DocError> for RpcError {
    fn from(e: &DocError) -> Self {
        let message = e.to_string();
        match e {
            DocError::NotFound(_) => Self::NotFound {
                code: DOCUMENT_NOT_FOUND.into(),
                message,
            },
            DocError::OutsideRoot(_) => Self::custom(INVALID_PATH, message),
            DocError::InvalidTask { .. } => Self::InvalidParams { message },
            DocError::Conflict { actual, .. } => Self::Custom {
                code: CONFLICT.into(),
                message,
                details: Some(serde_json::json!({ "version": actual })),
            },
            DocError::InvalidTransition(_) => Self::custom(INVALID_OPERATION, message),
            DocError::Io { .. } | DocError::Watch(_) => Self::Internal { message },
        }
    }
}

impl From<DocError> for RpcError {
    fn from(e: DocError) -> Self {
        Self::from(&e)
    }
}

impl From<RuntimeError> for RpcError {
    fn from(e: RuntimeError) -> Self {
        let message = e.to_string();
        match e {
            RuntimeError::SlotNotFound(_) => Self::NotFound {
                code: SLOT_NOT_FOUND.into(),
                message,
            },
            RuntimeError::WorkspaceNotFound(_) => Self::NotFound {
                code: WORKSPACE_NOT_FOUND.into(),
                message,
            },
            RuntimeError::Initialization(_) => Self::custom(INITIALIZATION_FAILED, message),
            RuntimeError::InvalidOperation(_) => Self::custom(INVALID_OPERATION, message),
            RuntimeError::Runtime(_) => Self::custom(RUNTIME_ERROR, message),
            RuntimeError::Docs(doc) => Self::from(doc.as_ref()),
            RuntimeError::Io(_) | RuntimeError::Internal(_) => Self::Internal { message },
        }
    }
}
