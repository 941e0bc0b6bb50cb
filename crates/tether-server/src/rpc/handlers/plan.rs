//! Plan document handlers.
//!
//! Paths may be absolute (inside a plan directory) or relative to the
//! workspace. Writes accept an optional `version`; a stale version fails
//! with `CONFLICT` and the current version in `details`.

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_docs::PlanDocument;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{
    opt_string_param, require_bool_param, require_path_param, require_string_param,
    require_usize_param, to_json, workspace_param,
};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{
    MAX_DOCUMENT_LENGTH, MAX_PARAM_LENGTH, reject_control_chars, require_non_blank,
    validate_string_param,
};

/// Plan with its raw content attached.
pub(crate) fn with_content(plan: &PlanDocument) -> Result<Value, RpcError> {
    let mut value = to_json(plan)?;
    value["content"] = Value::String(plan.content.clone());
    Ok(value)
}

/// Optional `version` for optimistic writes.
pub(crate) fn version_param(params: Option<&Value>) -> Result<Option<String>, RpcError> {
    opt_string_param(params, "version")
}

/// `title` plus optional `body` for document creation.
pub(crate) fn title_and_body(params: Option<&Value>) -> Result<(String, String), RpcError> {
    let title = require_string_param(params, "title")?;
    require_non_blank(&title, "title")?;
    validate_string_param(&title, "title", MAX_PARAM_LENGTH)?;
    reject_control_chars(&title, "title")?;
    let body = opt_string_param(params, "body")?.unwrap_or_default();
    validate_string_param(&body, "body", MAX_DOCUMENT_LENGTH)?;
    Ok((title, body))
}

/// All plans plus the active one.
pub struct ListPlansHandler;

#[async_trait]
impl MethodHandler for ListPlansHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let docs = workspace.docs();
        let plans = docs.list_plans().await;
        let active = docs.active_plan_path();
        Ok(json!({ "plans": to_json(&plans)?, "activePlan": active }))
    }
}

/// One plan, with content.
pub struct ReadPlanHandler;

#[async_trait]
impl MethodHandler for ReadPlanHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let plan = workspace.docs().read_plan(&path).await?;
        with_content(&plan)
    }
}

/// New draft plan.
pub struct CreatePlanHandler;

#[async_trait]
impl MethodHandler for CreatePlanHandler {
    #[instrument(skip(self, ctx, params), fields(method = "plan.create"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let (title, body) = title_and_body(params.as_ref())?;
        let plan = workspace.docs().create_plan(&title, &body).await?;
        with_content(&plan)
    }
}

/// Replace a plan's content.
pub struct WritePlanHandler;

#[async_trait]
impl MethodHandler for WritePlanHandler {
    #[instrument(skip(self, ctx, params), fields(method = "plan.write"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let content = require_string_param(params.as_ref(), "content")?;
        validate_string_param(&content, "content", MAX_DOCUMENT_LENGTH)?;
        let version = version_param(params.as_ref())?;
        let plan = workspace
            .docs()
            .write_plan(&path, &content, version.as_deref())
            .await?;
        to_json(&plan)
    }
}

/// Tick or untick one task.
pub struct UpdatePlanTaskHandler;

#[async_trait]
impl MethodHandler for UpdatePlanTaskHandler {
    #[instrument(skip(self, ctx, params), fields(method = "plan.updateTask"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let line = require_usize_param(params.as_ref(), "line")?;
        let done = require_bool_param(params.as_ref(), "done")?;
        let version = version_param(params.as_ref())?;
        let plan = workspace
            .docs()
            .update_plan_task(&path, line, done, version.as_deref())
            .await?;
        to_json(&plan)
    }
}

/// Make a plan the active one.
pub struct ActivatePlanHandler;

#[async_trait]
impl MethodHandler for ActivatePlanHandler {
    #[instrument(skip(self, ctx, params), fields(method = "plan.activate"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let plan = workspace.docs().activate_plan(&path).await?;
        to_json(&plan)
    }
}

/// Clear the active plan.
pub struct DeactivatePlanHandler;

#[async_trait]
impl MethodHandler for DeactivatePlanHandler {
    #[instrument(skip(self, ctx, params), fields(method = "plan.deactivate"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        workspace.docs().deactivate_plan().await;
        Ok(json!({ "deactivated": true }))
    }
}

/// The active plan, or `null`.
pub struct GetActivePlanHandler;

#[async_trait]
impl MethodHandler for GetActivePlanHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let plan = match workspace.docs().active_plan().await {
            Some(plan) => with_content(&plan)?,
            None => Value::Null,
        };
        Ok(json!({ "plan": plan }))
    }
}
