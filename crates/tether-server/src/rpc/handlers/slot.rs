//! Slot handlers: create, close, list.

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_core::SlotId;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{opt_string_param, require_string_param, to_json, workspace_param};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{MAX_PARAM_LENGTH, validate_string_param};

/// Create a conversation slot (idempotent per id).
pub struct CreateSlotHandler;

#[async_trait]
impl MethodHandler for CreateSlotHandler {
    #[instrument(skip(self, ctx), fields(method = "slot.create"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let slot = opt_string_param(params.as_ref(), "slotId")?;
        if let Some(id) = &slot {
            validate_string_param(id, "slotId", MAX_PARAM_LENGTH)?;
        }
        let snapshot = workspace
            .orchestrator()
            .create_slot(slot.map(SlotId::from))
            .await?;
        to_json(&snapshot)
    }
}

/// Close a slot, cancelling its pending UI requests.
pub struct CloseSlotHandler;

#[async_trait]
impl MethodHandler for CloseSlotHandler {
    #[instrument(skip(self, ctx), fields(method = "slot.close"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let slot = SlotId::from(require_string_param(params.as_ref(), "slotId")?);
        workspace.orchestrator().close_slot(&slot).await?;
        Ok(json!({ "slotId": slot, "closed": true }))
    }
}

/// Slots of a workspace.
pub struct ListSlotsHandler;

#[async_trait]
impl MethodHandler for ListSlotsHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        Ok(json!({ "slots": to_json(&workspace.orchestrator().list_slots())? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::errors;
    use crate::rpc::handlers::test_helpers::{make_test_context, make_test_context_with};
    use tether_runtime::testutil::MockFactory;

    #[tokio::test]
    async fn create_list_close() {
        let h = make_test_context();
        let ws = h.open().await;

        let created = CreateSlotHandler
            .handle(Some(json!({"workspaceId": ws, "slotId": "side"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(created["slotId"], "side");
        assert!(created["messages"].is_array());

        let list = ListSlotsHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(list["slots"].as_array().unwrap().len(), 2);

        let closed = CloseSlotHandler
            .handle(Some(json!({"workspaceId": ws, "slotId": "side"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(closed["closed"], true);
        assert!(h.factory.runtime(&SlotId::from("side")).unwrap().is_disposed());
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let h = make_test_context();
        let ws = h.open().await;
        for _ in 0..3 {
            let _ = CreateSlotHandler
                .handle(Some(json!({"workspaceId": ws, "slotId": "side"})), &h.ctx)
                .await
                .unwrap();
        }
        assert_eq!(h.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn close_unknown_slot() {
        let h = make_test_context();
        let ws = h.open().await;
        let err = CloseSlotHandler
            .handle(Some(json!({"workspaceId": ws, "slotId": "ghost"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::SLOT_NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_slot_reports_initialization_error() {
        let h = make_test_context_with(MockFactory::new().failing("broken"));
        let ws = h.open().await;
        let err = CreateSlotHandler
            .handle(Some(json!({"workspaceId": ws, "slotId": "broken"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::INITIALIZATION_FAILED);

        let list = ListSlotsHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(list["slots"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slot_id_must_be_string() {
        let h = make_test_context();
        let ws = h.open().await;
        let err = CreateSlotHandler
            .handle(Some(json!({"workspaceId": ws, "slotId": 7})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::INVALID_PARAMS);
    }
}
