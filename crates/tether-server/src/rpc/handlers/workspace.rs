//! Workspace handlers: open, detach, close, list, active.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_core::{WorkspaceEvent, event_types};
use tracing::{info, instrument};

use crate::rpc::context::RpcContext;
use crate::rpc::errors::{self, RpcError};
use crate::rpc::handlers::{require_string_param, to_json, workspace_id_param};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{MAX_PARAM_LENGTH, validate_string_param};

/// Open (or reattach to) the workspace at `path`.
///
/// Over a socket the connection's live stream is held until the response
/// has been sent, so `bufferedEvents` always precede live events.
pub struct OpenWorkspaceHandler;

#[async_trait]
impl MethodHandler for OpenWorkspaceHandler {
    #[instrument(skip(self, ctx), fields(method = "workspace.open"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let path = require_string_param(params.as_ref(), "path")?;
        validate_string_param(&path, "path", MAX_PARAM_LENGTH)?;

        let connection = ctx.connection.clone();
        if let Some(conn) = &connection {
            conn.hold();
        }
        let opened = ctx
            .manager
            .open_workspace(Path::new(&path), |id| {
                if let Some(conn) = &connection {
                    conn.attach(id);
                }
            })
            .await?;
        to_json(&opened)
    }
}

/// Stop receiving a workspace's events. The workspace keeps running.
pub struct DetachWorkspaceHandler;

#[async_trait]
impl MethodHandler for DetachWorkspaceHandler {
    #[instrument(skip(self, ctx), fields(method = "workspace.detach"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let id = workspace_id_param(params.as_ref())?;
        let _ = ctx.manager.workspace(&id)?;
        if ctx.connection.as_ref().is_some_and(|conn| !conn.detach(&id)) {
            return Err(RpcError::Custom {
                code: errors::INVALID_OPERATION.into(),
                message: format!("Connection is not attached to workspace {id}"),
                details: None,
            });
        }
        let attached = ctx.manager.detach(&id)?;
        Ok(json!({ "workspaceId": id, "attachedClients": attached }))
    }
}

/// Tear a workspace down after telling its attached clients.
pub struct CloseWorkspaceHandler;

#[async_trait]
impl MethodHandler for CloseWorkspaceHandler {
    #[instrument(skip(self, ctx), fields(method = "workspace.close"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let id = workspace_id_param(params.as_ref())?;
        let workspace = ctx.manager.workspace(&id)?;

        ctx.broadcast.broadcast_to_workspace(&WorkspaceEvent::new(
            event_types::WORKSPACE_CLOSED,
            id.clone(),
            None,
            json!({ "path": workspace.root() }),
        ));
        let notified = ctx.broadcast.workspace_connections(&id);
        for conn in &notified {
            conn.forget(&id);
        }

        ctx.manager.close_workspace(&id).await?;
        info!(workspace_id = %id, notified = notified.len(), "workspace closed by client");
        Ok(json!({ "workspaceId": id, "closed": true }))
    }
}

/// Every open workspace.
pub struct ListWorkspacesHandler;

#[async_trait]
impl MethodHandler for ListWorkspacesHandler {
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({ "workspaces": to_json(&ctx.manager.list_workspaces())? }))
    }
}

/// Workspaces with a running agent.
pub struct ActiveWorkspacesHandler;

#[async_trait]
impl MethodHandler for ActiveWorkspacesHandler {
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({ "workspaces": to_json(&ctx.manager.active_workspaces())? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::handlers::test_helpers::{make_test_context, next_json};
    use tether_core::{RuntimeEvent, SlotId, WorkspaceId};
    use tether_runtime::testutil::wait_until;
    use tokio::sync::mpsc;

    /// Message types received until one of type `until` arrives.
    async fn received_types(rx: &mut mpsc::Receiver<std::sync::Arc<String>>, until: &str) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await {
            let value: Value = serde_json::from_str(&msg).unwrap();
            let kind = value["type"].as_str().unwrap_or_default().to_owned();
            let done = kind == until;
            types.push(kind);
            if done {
                break;
            }
        }
        types
    }

    #[tokio::test]
    async fn open_creates_then_reattaches() {
        let h = make_test_context();
        let params = json!({"path": h.root()});

        let first = OpenWorkspaceHandler.handle(Some(params.clone()), &h.ctx).await.unwrap();
        assert_eq!(first["isExisting"], false);
        assert_eq!(first["workspace"]["attachedClients"], 1);

        let second = OpenWorkspaceHandler.handle(Some(params), &h.ctx).await.unwrap();
        assert_eq!(second["isExisting"], true);
        assert_eq!(second["workspace"]["id"], first["workspace"]["id"]);
        assert_eq!(second["workspace"]["attachedClients"], 2);
        assert_eq!(h.ctx.manager.workspace_count(), 1);
    }

    #[tokio::test]
    async fn open_missing_path_is_not_found() {
        let h = make_test_context();
        let err = OpenWorkspaceHandler
            .handle(Some(json!({"path": h.root().join("nope")})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::WORKSPACE_NOT_FOUND);
    }

    #[tokio::test]
    async fn open_requires_path() {
        let h = make_test_context();
        let err = OpenWorkspaceHandler.handle(Some(json!({})), &h.ctx).await.unwrap_err();
        assert_eq!(err.code(), errors::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn open_over_connection_holds_until_released() {
        let h = make_test_context();
        let (ctx, conn, mut rx) = h.connect("c1");
        let result = OpenWorkspaceHandler
            .handle(Some(json!({"path": h.root()})), &ctx)
            .await
            .unwrap();
        let id = WorkspaceId::from(result["workspace"]["id"].as_str().unwrap());
        assert!(conn.is_attached(&id));
        assert!(conn.is_held());

        let runtime = h.factory.runtime(&SlotId::default()).unwrap();
        runtime.emit(RuntimeEvent::AgentStart);
        wait_until(|| h.ctx.manager.active_workspaces().len() == 1).await;
        assert!(next_json(&mut rx).is_none());

        let _ = conn.release();
        let types = received_types(&mut rx, "agentStart").await;
        assert_eq!(types.last().map(String::as_str), Some("agentStart"));
    }

    #[tokio::test]
    async fn detach_keeps_workspace() {
        let h = make_test_context();
        let (ctx, conn, _rx) = h.connect("c1");
        let opened = OpenWorkspaceHandler
            .handle(Some(json!({"path": h.root()})), &ctx)
            .await
            .unwrap();
        let _ = conn.release();
        let id = opened["workspace"]["id"].clone();

        let result = DetachWorkspaceHandler
            .handle(Some(json!({"workspaceId": id})), &ctx)
            .await
            .unwrap();
        assert_eq!(result["attachedClients"], 0);
        assert_eq!(h.ctx.manager.workspace_count(), 1);

        let err = DetachWorkspaceHandler
            .handle(Some(json!({"workspaceId": id})), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::INVALID_OPERATION);
    }

    #[tokio::test]
    async fn detach_unknown_workspace() {
        let h = make_test_context();
        let err = DetachWorkspaceHandler
            .handle(Some(json!({"workspaceId": "missing"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::WORKSPACE_NOT_FOUND);
    }

    #[tokio::test]
    async fn close_notifies_then_removes() {
        let h = make_test_context();
        let (ctx, conn, mut rx) = h.connect("c1");
        let opened = OpenWorkspaceHandler
            .handle(Some(json!({"path": h.root()})), &ctx)
            .await
            .unwrap();
        let _ = conn.release();
        let id = opened["workspace"]["id"].clone();

        let result = CloseWorkspaceHandler
            .handle(Some(json!({"workspaceId": id})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result["closed"], true);
        assert_eq!(h.ctx.manager.workspace_count(), 0);

        let types = received_types(&mut rx, "workspaceClosed").await;
        assert!(types.contains(&"workspaceClosed".to_owned()));
        assert!(!conn.is_attached(&WorkspaceId::from(id.as_str().unwrap())));

        let reopened = OpenWorkspaceHandler
            .handle(Some(json!({"path": h.root()})), &h.ctx)
            .await
            .unwrap();
        assert_ne!(reopened["workspace"]["id"], id);
    }

    #[tokio::test]
    async fn list_and_active() {
        let h = make_test_context();
        let _ = h.open().await;
        let all = ListWorkspacesHandler.handle(None, &h.ctx).await.unwrap();
        assert_eq!(all["workspaces"].as_array().unwrap().len(), 1);
        let active = ActiveWorkspacesHandler.handle(None, &h.ctx).await.unwrap();
        assert!(active["workspaces"].as_array().unwrap().is_empty());

        h.factory.runtime(&SlotId::default()).unwrap().emit(RuntimeEvent::AgentStart);
        wait_until(|| h.ctx.manager.active_workspaces().len() == 1).await;
        let active = ActiveWorkspacesHandler.handle(None, &h.ctx).await.unwrap();
        assert_eq!(active["workspaces"][0]["isActive"], true);
    }
}
