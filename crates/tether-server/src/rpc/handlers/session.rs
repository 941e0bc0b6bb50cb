//! Session handlers: prompt, queueing, model control, session files.
//!
//! Every method takes `workspaceId` and an optional `slotId` (default slot
//! when absent) and waits for the slot to finish initializing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_core::SlotId;
use tether_runtime::Workspace;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{
    opt_string_param, require_string_param, slot_param, to_json, workspace_param,
};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{
    MAX_PARAM_LENGTH, MAX_PROMPT_LENGTH, require_non_blank, validate_string_param,
};

fn target(params: Option<&Value>, ctx: &RpcContext) -> Result<(Arc<Workspace>, SlotId), RpcError> {
    Ok((workspace_param(params, ctx)?, slot_param(params)?))
}

fn text_param(params: Option<&Value>) -> Result<String, RpcError> {
    let text = require_string_param(params, "text")?;
    require_non_blank(&text, "text")?;
    validate_string_param(&text, "text", MAX_PROMPT_LENGTH)?;
    Ok(text)
}

fn short_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    let value = require_string_param(params, key)?;
    validate_string_param(&value, key, MAX_PARAM_LENGTH)?;
    Ok(value)
}

/// Start a run.
pub struct PromptHandler;

#[async_trait]
impl MethodHandler for PromptHandler {
    #[instrument(skip(self, ctx, params), fields(method = "session.prompt"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let text = text_param(params.as_ref())?;
        let images = match params.as_ref().and_then(|p| p.get("images")) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(images)) => images.clone(),
            Some(_) => {
                return Err(RpcError::InvalidParams {
                    message: "Parameter 'images' must be an array".into(),
                });
            }
        };
        workspace.orchestrator().prompt(&slot, &text, images).await?;
        Ok(json!({ "accepted": true, "slotId": slot }))
    }
}

/// Queue steering text for the running turn.
pub struct SteerHandler;

#[async_trait]
impl MethodHandler for SteerHandler {
    #[instrument(skip(self, ctx, params), fields(method = "session.steer"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let text = text_param(params.as_ref())?;
        let queue = workspace.orchestrator().steer(&slot, &text).await?;
        to_json(&queue)
    }
}

/// Queue text for after the run.
pub struct FollowUpHandler;

#[async_trait]
impl MethodHandler for FollowUpHandler {
    #[instrument(skip(self, ctx, params), fields(method = "session.followUp"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let text = text_param(params.as_ref())?;
        let queue = workspace.orchestrator().follow_up(&slot, &text).await?;
        to_json(&queue)
    }
}

/// Stop the current run.
pub struct AbortHandler;

#[async_trait]
impl MethodHandler for AbortHandler {
    #[instrument(skip(self, ctx), fields(method = "session.abort"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        workspace.orchestrator().abort(&slot).await?;
        Ok(json!({ "aborted": true }))
    }
}

/// Switch model.
pub struct SetModelHandler;

#[async_trait]
impl MethodHandler for SetModelHandler {
    #[instrument(skip(self, ctx), fields(method = "session.setModel"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let provider = short_param(params.as_ref(), "provider")?;
        let model_id = short_param(params.as_ref(), "modelId")?;
        Ok(workspace
            .orchestrator()
            .set_model(&slot, &provider, &model_id)
            .await?)
    }
}

/// Set the thinking level.
pub struct SetThinkingLevelHandler;

#[async_trait]
impl MethodHandler for SetThinkingLevelHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let level = short_param(params.as_ref(), "level")?;
        workspace
            .orchestrator()
            .set_thinking_level(&slot, &level)
            .await?;
        Ok(json!({ "level": level }))
    }
}

/// Advance to the next configured model.
pub struct CycleModelHandler;

#[async_trait]
impl MethodHandler for CycleModelHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        Ok(workspace.orchestrator().cycle_model(&slot).await?)
    }
}

/// Start a fresh session file in the slot.
pub struct NewSessionHandler;

#[async_trait]
impl MethodHandler for NewSessionHandler {
    #[instrument(skip(self, ctx), fields(method = "session.new"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        Ok(workspace.orchestrator().new_session(&slot).await?)
    }
}

/// Load another session file into the slot.
pub struct SwitchSessionHandler;

#[async_trait]
impl MethodHandler for SwitchSessionHandler {
    #[instrument(skip(self, ctx), fields(method = "session.switch"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let path = short_param(params.as_ref(), "sessionPath")?;
        Ok(workspace.orchestrator().switch_session(&slot, &path).await?)
    }
}

/// Summarize older context.
pub struct CompactHandler;

#[async_trait]
impl MethodHandler for CompactHandler {
    #[instrument(skip(self, ctx, params), fields(method = "session.compact"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let instructions = opt_string_param(params.as_ref(), "customInstructions")?;
        if let Some(text) = &instructions {
            validate_string_param(text, "customInstructions", MAX_PROMPT_LENGTH)?;
        }
        Ok(workspace
            .orchestrator()
            .compact(&slot, instructions.as_deref())
            .await?)
    }
}

/// Branch the conversation at an entry.
pub struct ForkHandler;

#[async_trait]
impl MethodHandler for ForkHandler {
    #[instrument(skip(self, ctx), fields(method = "session.fork"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let entry_id = short_param(params.as_ref(), "entryId")?;
        Ok(workspace.orchestrator().fork(&slot, &entry_id).await?)
    }
}

/// Runtime state of the slot.
pub struct GetStateHandler;

#[async_trait]
impl MethodHandler for GetStateHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let state = workspace.orchestrator().get_state(&slot).await?;
        to_json(&state)
    }
}

/// Transcript of the slot.
pub struct GetMessagesHandler;

#[async_trait]
impl MethodHandler for GetMessagesHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let (workspace, slot) = target(params.as_ref(), ctx)?;
        let messages = workspace.orchestrator().get_messages(&slot).await?;
        Ok(json!({ "messages": messages }))
    }
}

/// Saved sessions of the workspace.
pub struct ListSessionsHandler;

#[async_trait]
impl MethodHandler for ListSessionsHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let sessions = workspace.orchestrator().list_sessions().await?;
        Ok(json!({ "sessions": to_json(&sessions)? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::errors;
    use crate::rpc::handlers::test_helpers::make_test_context;
    use tether_runtime::SessionSummary;

    #[tokio::test]
    async fn prompt_reaches_default_slot() {
        let h = make_test_context();
        let ws = h.open().await;
        let result = PromptHandler
            .handle(Some(json!({"workspaceId": ws, "text": "hello"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result["slotId"], "default");
        let runtime = h.factory.runtime(&SlotId::default()).unwrap();
        assert_eq!(runtime.prompts(), ["hello"]);
    }

    #[tokio::test]
    async fn prompt_validates_text_and_images() {
        let h = make_test_context();
        let ws = h.open().await;
        let blank = PromptHandler
            .handle(Some(json!({"workspaceId": ws, "text": "   "})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(blank.code(), errors::INVALID_PARAMS);
        let images = PromptHandler
            .handle(Some(json!({"workspaceId": ws, "text": "hi", "images": "x"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(images.code(), errors::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn prompt_unknown_slot() {
        let h = make_test_context();
        let ws = h.open().await;
        let err = PromptHandler
            .handle(Some(json!({"workspaceId": ws, "slotId": "nope", "text": "hi"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::SLOT_NOT_FOUND);
    }

    #[tokio::test]
    async fn steer_and_follow_up_return_queue() {
        let h = make_test_context();
        let ws = h.open().await;
        let steer = SteerHandler
            .handle(Some(json!({"workspaceId": ws, "text": "faster"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(steer["steering"], json!(["faster"]));
        let follow = FollowUpHandler
            .handle(Some(json!({"workspaceId": ws, "text": "then docs"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(follow["steering"], json!(["faster"]));
        assert_eq!(follow["followUp"], json!(["then docs"]));
    }

    #[tokio::test]
    async fn model_controls() {
        let h = make_test_context();
        let ws = h.open().await;
        let model = SetModelHandler
            .handle(
                Some(json!({"workspaceId": ws, "provider": "anthropic", "modelId": "m1"})),
                &h.ctx,
            )
            .await
            .unwrap();
        assert_eq!(model["id"], "m1");
        let _ = SetThinkingLevelHandler
            .handle(Some(json!({"workspaceId": ws, "level": "high"})), &h.ctx)
            .await
            .unwrap();
        let state = GetStateHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(state["model"]["provider"], "anthropic");
        assert_eq!(state["thinkingLevel"], "high");
        let cycled = CycleModelHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(cycled["id"], "m1");
    }

    #[tokio::test]
    async fn set_model_requires_model_id() {
        let h = make_test_context();
        let ws = h.open().await;
        let err = SetModelHandler
            .handle(Some(json!({"workspaceId": ws, "provider": "anthropic"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn session_file_operations() {
        let h = make_test_context();
        let ws = h.open().await;
        let _ = NewSessionHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        let switched = SwitchSessionHandler
            .handle(Some(json!({"workspaceId": ws, "sessionPath": "/s/a.jsonl"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(switched["cancelled"], false);
        let state = GetStateHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(state["sessionFile"], "/s/a.jsonl");

        let compacted = CompactHandler
            .handle(Some(json!({"workspaceId": ws, "customInstructions": "short"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(compacted["summary"], "short");
        let forked = ForkHandler
            .handle(Some(json!({"workspaceId": ws, "entryId": "e1"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(forked["entryId"], "e1");
    }

    #[tokio::test]
    async fn messages_and_abort() {
        let h = make_test_context();
        let ws = h.open().await;
        let _ = PromptHandler
            .handle(Some(json!({"workspaceId": ws, "text": "hi"})), &h.ctx)
            .await
            .unwrap();
        let messages = GetMessagesHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(messages["messages"].as_array().unwrap().len(), 1);
        let aborted = AbortHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(aborted["aborted"], true);
    }

    #[tokio::test]
    async fn list_drops_empty_sessions() {
        let h = make_test_context();
        let ws = h.open().await;
        h.factory
            .runtime(&SlotId::default())
            .unwrap()
            .set_sessions(vec![
                SessionSummary {
                    path: "/s/full.jsonl".into(),
                    id: "full".into(),
                    message_count: 4,
                    ..SessionSummary::default()
                },
                SessionSummary {
                    path: "/s/empty.jsonl".into(),
                    id: "empty".into(),
                    message_count: 0,
                    ..SessionSummary::default()
                },
            ]);
        let result = ListSessionsHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        let sessions = result["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], "full");
    }

    #[tokio::test]
    async fn unknown_workspace() {
        let h = make_test_context();
        let err = GetStateHandler
            .handle(Some(json!({"workspaceId": "nope"})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::WORKSPACE_NOT_FOUND);
    }
}
