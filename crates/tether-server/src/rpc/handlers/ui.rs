//! Answers to extension UI and questionnaire requests.
//!
//! The request id alone routes the answer; `workspaceId` is only a fallback
//! for requests raised before a restart of the routing table. Unknown or
//! already settled ids are accepted as no-ops.

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_core::{RequestId, SlotId, WorkspaceId};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{opt_string_param, require_param, require_string_param};
use crate::rpc::registry::MethodHandler;

fn declared_target(params: Option<&Value>) -> Result<(Option<WorkspaceId>, Option<SlotId>), RpcError> {
    Ok((
        opt_string_param(params, "workspaceId")?.map(WorkspaceId::from),
        opt_string_param(params, "slotId")?.map(SlotId::from),
    ))
}

/// `ui.respond`: answer an extension dialog.
pub struct UiRespondHandler;

#[async_trait]
impl MethodHandler for UiRespondHandler {
    #[instrument(skip(self, ctx, params), fields(method = "ui.respond"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let request_id = RequestId::from(require_string_param(params.as_ref(), "requestId")?);
        let response = require_param(params.as_ref(), "response")?.clone();
        let (workspace, slot) = declared_target(params.as_ref())?;

        let accepted =
            ctx.manager
                .respond_ui(&request_id, workspace.as_ref(), slot.as_ref(), response);
        Ok(json!({ "requestId": request_id, "accepted": accepted }))
    }
}

/// `questionnaire.respond`: submit (or cancel) a questionnaire.
///
/// The id may be given as `requestId` or `toolCallId`. With
/// `cancelled: true` no answers are required.
pub struct QuestionnaireRespondHandler;

#[async_trait]
impl MethodHandler for QuestionnaireRespondHandler {
    #[instrument(skip(self, ctx, params), fields(method = "questionnaire.respond"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let p = params.as_ref();
        let id = match opt_string_param(p, "requestId")? {
            Some(id) => id,
            None => require_string_param(p, "toolCallId")?,
        };
        let request_id = RequestId::from(id);
        let cancelled = p
            .and_then(|v| v.get("cancelled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let response = if cancelled {
            json!({ "cancelled": true })
        } else {
            json!({ "answers": require_param(p, "answers")?.clone() })
        };
        let (workspace, slot) = declared_target(p)?;

        let accepted =
            ctx.manager
                .respond_ui(&request_id, workspace.as_ref(), slot.as_ref(), response);
        Ok(json!({ "requestId": request_id, "accepted": accepted }))
    }
}
