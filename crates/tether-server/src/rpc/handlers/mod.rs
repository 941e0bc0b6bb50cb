//! RPC method handlers, grouped by namespace.

pub mod job;
pub mod plan;
pub mod session;
pub mod slot;
pub mod sync;
pub mod system;
pub mod ui;
pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tether_core::{SlotId, WorkspaceId};
use tether_runtime::Workspace;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::validation::{MAX_PARAM_LENGTH, validate_string_param};

/// Register every handler.
pub fn register_all(registry: &mut MethodRegistry) {
    // System
    registry.register("system.ping", system::PingHandler);
    registry.register("system.getInfo", system::GetInfoHandler);

    // Workspace
    registry.register("workspace.open", workspace::OpenWorkspaceHandler);
    registry.register("workspace.detach", workspace::DetachWorkspaceHandler);
    registry.register("workspace.close", workspace::CloseWorkspaceHandler);
    registry.register("workspace.list", workspace::ListWorkspacesHandler);
    registry.register("workspace.active", workspace::ActiveWorkspacesHandler);

    // Slot
    registry.register("slot.create", slot::CreateSlotHandler);
    registry.register("slot.close", slot::CloseSlotHandler);
    registry.register("slot.list", slot::ListSlotsHandler);

    // Session
    registry.register("session.prompt", session::PromptHandler);
    registry.register("session.steer", session::SteerHandler);
    registry.register("session.followUp", session::FollowUpHandler);
    registry.register("session.abort", session::AbortHandler);
    registry.register("session.setModel", session::SetModelHandler);
    registry.register("session.setThinkingLevel", session::SetThinkingLevelHandler);
    registry.register("session.cycleModel", session::CycleModelHandler);
    registry.register("session.new", session::NewSessionHandler);
    registry.register("session.switch", session::SwitchSessionHandler);
    registry.register("session.compact", session::CompactHandler);
    registry.register("session.fork", session::ForkHandler);
    registry.register("session.getState", session::GetStateHandler);
    registry.register("session.getMessages", session::GetMessagesHandler);
    registry.register("session.list", session::ListSessionsHandler);

    // UI requests
    registry.register("ui.respond", ui::UiRespondHandler);
    registry.register("questionnaire.respond", ui::QuestionnaireRespondHandler);

    // Plans
    registry.register("plan.list", plan::ListPlansHandler);
    registry.register("plan.read", plan::ReadPlanHandler);
    registry.register("plan.create", plan::CreatePlanHandler);
    registry.register("plan.write", plan::WritePlanHandler);
    registry.register("plan.updateTask", plan::UpdatePlanTaskHandler);
    registry.register("plan.activate", plan::ActivatePlanHandler);
    registry.register("plan.deactivate", plan::DeactivatePlanHandler);
    registry.register("plan.getActive", plan::GetActivePlanHandler);

    // Jobs
    registry.register("job.list", job::ListJobsHandler);
    registry.register("job.read", job::ReadJobHandler);
    registry.register("job.create", job::CreateJobHandler);
    registry.register("job.write", job::WriteJobHandler);
    registry.register("job.updateTask", job::UpdateJobTaskHandler);
    registry.register("job.promote", job::PromoteJobHandler);
    registry.register("job.demote", job::DemoteJobHandler);
    registry.register("job.getActive", job::GetActiveJobsHandler);

    // Sync
    registry.register("sync.snapshot", sync::SnapshotHandler);
}

/// Extract a required parameter.
pub(crate) fn require_param<'a>(params: Option<&'a Value>, key: &str) -> Result<&'a Value, RpcError> {
    params
        .and_then(|p| p.get(key))
        .filter(|v| !v.is_null())
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Missing required parameter: {key}"),
        })
}

/// Extract a required string parameter.
pub(crate) fn require_string_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    require_param(params, key)?
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a string"),
        })
}

/// Extract an optional string parameter.
pub(crate) fn opt_string_param(params: Option<&Value>, key: &str) -> Result<Option<String>, RpcError> {
    match params.and_then(|p| p.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a string"),
        }),
    }
}

/// Extract a required boolean parameter.
pub(crate) fn require_bool_param(params: Option<&Value>, key: &str) -> Result<bool, RpcError> {
    require_param(params, key)?
        .as_bool()
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a boolean"),
        })
}

/// Extract a required non-negative integer parameter.
pub(crate) fn require_usize_param(params: Option<&Value>, key: &str) -> Result<usize, RpcError> {
    require_param(params, key)?
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a non-negative integer"),
        })
}

/// Required document path, relative to the workspace or absolute inside it.
pub(crate) fn require_path_param(params: Option<&Value>, key: &str) -> Result<PathBuf, RpcError> {
    let path = require_string_param(params, key)?;
    validate_string_param(&path, key, MAX_PARAM_LENGTH)?;
    Ok(PathBuf::from(path))
}

/// `workspaceId` parameter.
pub(crate) fn workspace_id_param(params: Option<&Value>) -> Result<WorkspaceId, RpcError> {
    require_string_param(params, "workspaceId").map(WorkspaceId::from)
}

/// `slotId` parameter, defaulting to the workspace's default slot.
pub(crate) fn slot_param(params: Option<&Value>) -> Result<SlotId, RpcError> {
    Ok(opt_string_param(params, "slotId")?.map_or_else(SlotId::default, SlotId::from))
}

/// The workspace named by `workspaceId`.
pub(crate) fn workspace_param(params: Option<&Value>, ctx: &RpcContext) -> Result<Arc<Workspace>, RpcError> {
    let id = workspace_id_param(params)?;
    Ok(ctx.manager.workspace(&id)?)
}

/// Serialize a handler result.
pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal {
        message: format!("failed to serialize result: {e}"),
    })
}
