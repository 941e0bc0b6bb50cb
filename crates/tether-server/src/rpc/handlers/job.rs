//! Job document handlers.
//!
//! Phase changes go through the workspace's job automation so that
//! entering planning, execution, or review also starts the phase's slot.

use async_trait::async_trait;
use serde_json::{Value, json};
use tether_docs::JobDocument;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::plan::{title_and_body, version_param};
use crate::rpc::handlers::{
    require_bool_param, require_path_param, require_string_param, require_usize_param, to_json,
    workspace_param,
};
use crate::rpc::registry::MethodHandler;
use crate::rpc::validation::{MAX_DOCUMENT_LENGTH, validate_string_param};

fn with_content(job: &JobDocument) -> Result<Value, RpcError> {
    let mut value = to_json(job)?;
    value["content"] = Value::String(job.content.clone());
    Ok(value)
}

/// All jobs.
pub struct ListJobsHandler;

#[async_trait]
impl MethodHandler for ListJobsHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let jobs = workspace.docs().list_jobs().await;
        Ok(json!({ "jobs": to_json(&jobs)? }))
    }
}

/// One job, with content.
pub struct ReadJobHandler;

#[async_trait]
impl MethodHandler for ReadJobHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let job = workspace.docs().read_job(&path).await?;
        with_content(&job)
    }
}

/// New job in the backlog.
pub struct CreateJobHandler;

#[async_trait]
impl MethodHandler for CreateJobHandler {
    #[instrument(skip(self, ctx, params), fields(method = "job.create"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let (title, body) = title_and_body(params.as_ref())?;
        let job = workspace.docs().create_job(&title, &body).await?;
        with_content(&job)
    }
}

/// Replace a job's content.
pub struct WriteJobHandler;

#[async_trait]
impl MethodHandler for WriteJobHandler {
    #[instrument(skip(self, ctx, params), fields(method = "job.write"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let content = require_string_param(params.as_ref(), "content")?;
        validate_string_param(&content, "content", MAX_DOCUMENT_LENGTH)?;
        let version = version_param(params.as_ref())?;
        let job = workspace
            .docs()
            .write_job(&path, &content, version.as_deref())
            .await?;
        to_json(&job)
    }
}

/// Tick or untick one task.
pub struct UpdateJobTaskHandler;

#[async_trait]
impl MethodHandler for UpdateJobTaskHandler {
    #[instrument(skip(self, ctx, params), fields(method = "job.updateTask"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let line = require_usize_param(params.as_ref(), "line")?;
        let done = require_bool_param(params.as_ref(), "done")?;
        let version = version_param(params.as_ref())?;
        let job = workspace
            .docs()
            .update_job_task(&path, line, done, version.as_deref())
            .await?;
        to_json(&job)
    }
}

/// Advance a job one phase.
pub struct PromoteJobHandler;

#[async_trait]
impl MethodHandler for PromoteJobHandler {
    #[instrument(skip(self, ctx, params), fields(method = "job.promote"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let job = workspace.automation().promote(&path).await?;
        to_json(&job)
    }
}

/// Move a job one phase back.
pub struct DemoteJobHandler;

#[async_trait]
impl MethodHandler for DemoteJobHandler {
    #[instrument(skip(self, ctx, params), fields(method = "job.demote"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let path = require_path_param(params.as_ref(), "path")?;
        let job = workspace.automation().demote(&path).await?;
        to_json(&job)
    }
}

/// Jobs in planning, execution, or review.
pub struct GetActiveJobsHandler;

#[async_trait]
impl MethodHandler for GetActiveJobsHandler {
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let workspace = workspace_param(params.as_ref(), ctx)?;
        let jobs = workspace.docs().active_jobs().await;
        Ok(json!({ "jobs": to_json(&jobs)? }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::errors;
    use crate::rpc::handlers::test_helpers::make_test_context;
    use tether_core::SlotId;

    #[tokio::test]
    async fn create_starts_in_backlog() {
        let h = make_test_context();
        let ws = h.open().await;
        let job = CreateJobHandler
            .handle(Some(json!({"workspaceId": ws, "title": "Refactor parser"})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(job["phase"], "backlog");
        assert!(job["content"].as_str().unwrap().contains("## Tasks"));

        let list = ListJobsHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(list["jobs"].as_array().unwrap().len(), 1);
        let active = GetActiveJobsHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert!(active["jobs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn promote_into_planning_prompts_new_slot() {
        let h = make_test_context();
        let ws = h.open().await;
        let job = CreateJobHandler
            .handle(
                Some(json!({"workspaceId": ws, "title": "Add cache", "body": "# Add cache\n\n- [ ] design\n"})),
                &h.ctx,
            )
            .await
            .unwrap();

        let promoted = PromoteJobHandler
            .handle(Some(json!({"workspaceId": ws, "path": job["path"]})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(promoted["phase"], "planning");
        let slot = SlotId::from(promoted["planningSessionId"].as_str().unwrap());
        let runtime = h.factory.runtime(&slot).unwrap();
        assert_eq!(runtime.prompts().len(), 1);

        let active = GetActiveJobsHandler
            .handle(Some(json!({"workspaceId": ws})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(active["jobs"].as_array().unwrap().len(), 1);

        let demoted = DemoteJobHandler
            .handle(Some(json!({"workspaceId": ws, "path": job["path"]})), &h.ctx)
            .await
            .unwrap();
        assert_eq!(demoted["phase"], "backlog");
    }

    #[tokio::test]
    async fn demote_from_backlog_is_invalid() {
        let h = make_test_context();
        let ws = h.open().await;
        let job = CreateJobHandler
            .handle(Some(json!({"workspaceId": ws, "title": "Nothing yet"})), &h.ctx)
            .await
            .unwrap();
        let err = DemoteJobHandler
            .handle(Some(json!({"workspaceId": ws, "path": job["path"]})), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errors::INVALID_OPERATION);
    }

    #[tokio::test]
    async fn task_update_is_idempotent() {
        let h = make_test_context();
        let ws = h.open().await;
        let job = CreateJobHandler
            .handle(
                Some(json!({"workspaceId": ws, "title": "Docs", "body": "# Docs\n\n- [ ] write\n"})),
                &h.ctx,
            )
            .await
            .unwrap();
        let line = job["tasks"][0]["line"].clone();
        let params = json!({"workspaceId": ws, "path": job["path"], "line": line, "done": true});
        let first = UpdateJobTaskHandler
            .handle(Some(params.clone()), &h.ctx)
            .await
            .unwrap();
        let second = UpdateJobTaskHandler.handle(Some(params), &h.ctx).await.unwrap();
        assert_eq!(first["doneCount"], 1);
        assert_eq!(first["version"], second["version"]);
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let h = make_test_context();
        let ws = h.open().await;
        let job = CreateJobHandler
            .handle(Some(json!({"workspaceId": ws, "title": "Rewrite"})), &h.ctx)
            .await
            .unwrap();
        let written = WriteJobHandler
            .handle(
                Some(json!({
                    "workspaceId": ws,
                    "path": job["path"],
                    "content": "---\nphase: review\n---\n# Rewrite\n\n## Review\n",
                    "version": job["version"],
                })),
                &h.ctx,
            )
            .await
            .unwrap();
        assert_eq!(written["phase"], "review");
        assert_eq!(written["hasReview"], true);

        let read = ReadJobHandler
            .handle(Some(json!({"workspaceId": ws, "path": job["path"]})), &h.ctx)
            .await
            .unwrap();
        assert!(read["content"].as_str().unwrap().contains("## Review"));
    }
}
