//! `sync.snapshot`: last persisted state of a workspace.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{opt_string_param, to_json, workspace_param};
use crate::rpc::registry::MethodHandler;

/// Snapshot by `workspaceId` (open workspace) or `path` (open or not).
pub struct SnapshotHandler;

#[async_trait]
impl MethodHandler for SnapshotHandler {
    #[instrument(skip(self, ctx, params), fields(method = "sync.snapshot"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let Some(store) = ctx.snapshots.clone() else {
            return Err(RpcError::NotAvailable {
                message: "State sync is disabled".into(),
            });
        };

        let key = match opt_string_param(params.as_ref(), "path")? {
            Some(path) => tokio::fs::canonicalize(&path)
                .await
                .unwrap_or_else(|_| PathBuf::from(&path))
                .display()
                .to_string(),
            None => workspace_param(params.as_ref(), ctx)?
                .root()
                .display()
                .to_string(),
        };

        let snapshot = tokio::task::spawn_blocking(move || store.snapshot(&key))
            .await
            .map_err(|e| RpcError::Internal {
                message: format!("snapshot task failed: {e}"),
            })?
            .map_err(|e| RpcError::Internal {
                message: e.to_string(),
            })?;
        to_json(&snapshot)
    }
}
