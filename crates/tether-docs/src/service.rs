//! Per-workspace plan and job service.
//!
//! Owns the active-plan marker, applies plan auto-completion, and
//! broadcasts refreshed lists through the workspace's [`EventSink`]. Both
//! reconciliation triggers (file watcher and fingerprint poll) end up in
//! [`DocsService::reconcile`], which is safe to run any number of times.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tether_core::{EventSink, SlotId, WorkspaceEvent, WorkspaceId, event_types};
use tether_settings::DocsSettings;
use tracing::{debug, info, instrument, warn};

use crate::errors::{DocError, Result};
use crate::job::{self, JobDocument, JobPhase, keys};
use crate::plan::{self, PlanDocument, PlanStatus};
use crate::store::{DocStore, fingerprint};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Plans and jobs of one workspace.
pub struct DocsService {
    workspace_id: WorkspaceId,
    plans: DocStore,
    jobs: DocStore,
    active_plan: Mutex<Option<PathBuf>>,
    fingerprints: Mutex<HashMap<PathBuf, String>>,
    sink: Arc<dyn EventSink>,
}

impl DocsService {
    /// Service over the configured directories of `root`.
    pub fn new(
        workspace_id: WorkspaceId,
        root: &Path,
        settings: &DocsSettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            workspace_id,
            plans: DocStore::new(root, &settings.plan_dirs),
            jobs: DocStore::new(root, &settings.job_dirs),
            active_plan: Mutex::new(None),
            fingerprints: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Owning workspace.
    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// Directories to watch, plans first.
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        self.plans
            .dirs()
            .iter()
            .chain(self.jobs.dirs())
            .cloned()
            .collect()
    }

    /// Adopt the first plan whose header says `active` as the active plan.
    pub async fn restore_active_plan(&self) {
        let docs = self.plans.scan().await;
        if let Some(doc) = docs
            .into_iter()
            .find(|d| d.frontmatter.get("status").map(PlanStatus::parse) == Some(PlanStatus::Active))
        {
            debug!(path = %doc.path.display(), "restored active plan");
            *self.active_plan.lock() = Some(doc.path);
        }
    }

    // ── Plans ───────────────────────────────────────────────────────────

    fn to_plan(&self, doc: crate::store::Document) -> PlanDocument {
        let is_active = self.active_plan.lock().as_deref() == Some(doc.path.as_path());
        PlanDocument::from_document(doc, is_active)
    }

    /// All plans, sorted by path.
    pub async fn list_plans(&self) -> Vec<PlanDocument> {
        self.plans
            .scan()
            .await
            .into_iter()
            .map(|d| self.to_plan(d))
            .collect()
    }

    /// One plan.
    pub async fn read_plan(&self, path: &Path) -> Result<PlanDocument> {
        Ok(self.to_plan(self.plans.read(path).await?))
    }

    /// Create a draft plan.
    #[instrument(skip(self, body), fields(workspace_id = %self.workspace_id))]
    pub async fn create_plan(&self, title: &str, body: &str) -> Result<PlanDocument> {
        let content = plan::new_plan_content(title, body, &now());
        let plan = self.to_plan(self.plans.create(title, &content).await?);
        info!(path = %plan.path.display(), "plan created");
        self.broadcast_plans().await;
        Ok(plan)
    }

    /// Replace a plan's content.
    #[instrument(skip(self, content), fields(workspace_id = %self.workspace_id, path = %path.display()))]
    pub async fn write_plan(
        &self,
        path: &Path,
        content: &str,
        expected_version: Option<&str>,
    ) -> Result<PlanDocument> {
        let doc = self.plans.write(path, content, expected_version).await?;
        let plan = self.complete_plan_if_done(self.to_plan(doc)).await;
        self.broadcast_plans().await;
        Ok(plan)
    }

    /// Tick or untick one plan task, auto-completing the plan when it was
    /// the last open task.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id, path = %path.display()))]
    pub async fn update_plan_task(
        &self,
        path: &Path,
        line: usize,
        done: bool,
        expected_version: Option<&str>,
    ) -> Result<PlanDocument> {
        let doc = self.plans.update_task(path, line, done, expected_version).await?;
        let plan = self.complete_plan_if_done(self.to_plan(doc)).await;
        self.broadcast_plans().await;
        Ok(plan)
    }

    /// Make `path` the active plan, demoting the previous one to draft.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id, path = %path.display()))]
    pub async fn activate_plan(&self, path: &Path) -> Result<PlanDocument> {
        let target = self.plans.read(path).await?;
        if PlanDocument::from_document(target.clone(), false).status == PlanStatus::Complete {
            return Err(DocError::InvalidTransition(format!(
                "plan {} is already complete",
                target.path.display()
            )));
        }

        let previous = self.active_plan.lock().clone();
        if let Some(prev) = previous.filter(|p| *p != target.path) {
            self.demote_to_draft(&prev).await;
        }

        let doc = self
            .plans
            .edit_frontmatter(&target.path, None, |fm| {
                fm.set("status", PlanStatus::Active.as_str());
            })
            .await?;
        *self.active_plan.lock() = Some(doc.path.clone());
        info!("plan activated");
        let plan = self.to_plan(doc);
        self.broadcast_plans().await;
        Ok(plan)
    }

    /// Clear the active plan, returning it to draft.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn deactivate_plan(&self) {
        let previous = self.active_plan.lock().take();
        if let Some(prev) = previous {
            self.demote_to_draft(&prev).await;
            info!(path = %prev.display(), "plan deactivated");
        }
        self.broadcast_plans().await;
    }

    async fn demote_to_draft(&self, path: &Path) {
        let result = self
            .plans
            .edit_frontmatter(path, None, |fm| {
                if fm.get("status").map(PlanStatus::parse) == Some(PlanStatus::Active) {
                    fm.set("status", PlanStatus::Draft.as_str());
                }
            })
            .await;
        match result {
            Ok(_) | Err(DocError::NotFound(_)) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to demote previous plan"),
        }
    }

    /// Path of the active plan.
    pub fn active_plan_path(&self) -> Option<PathBuf> {
        self.active_plan.lock().clone()
    }

    /// The active plan, if it still exists.
    pub async fn active_plan(&self) -> Option<PlanDocument> {
        let path = self.active_plan_path()?;
        self.read_plan(&path).await.ok()
    }

    fn clear_active_if(&self, path: &Path) -> bool {
        let mut active = self.active_plan.lock();
        if active.as_deref() == Some(path) {
            *active = None;
            true
        } else {
            false
        }
    }

    /// Mark a fully ticked plan complete.
    ///
    /// Conflicts and write failures are logged and leave the file as it
    /// was; the next reconciliation pass retries.
    async fn complete_plan_if_done(&self, plan: PlanDocument) -> PlanDocument {
        if !plan.needs_completion() {
            return plan;
        }
        let stamp = now();
        let result = self
            .plans
            .edit_frontmatter(&plan.path, Some(&plan.version), |fm| {
                fm.set("status", PlanStatus::Complete.as_str());
                fm.set("completedAt", stamp);
            })
            .await;
        match result {
            Ok(doc) => {
                let was_active = self.clear_active_if(&doc.path);
                info!(
                    path = %doc.path.display(),
                    tasks = doc.task_count,
                    was_active,
                    "plan auto-completed"
                );
                PlanDocument::from_document(doc, false)
            }
            Err(DocError::Conflict { .. }) => {
                debug!(path = %plan.path.display(), "plan changed during auto-complete, deferring");
                plan
            }
            Err(e) => {
                warn!(path = %plan.path.display(), error = %e, "plan auto-complete failed");
                plan
            }
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    /// All jobs, sorted by path.
    pub async fn list_jobs(&self) -> Vec<JobDocument> {
        self.jobs
            .scan()
            .await
            .into_iter()
            .map(JobDocument::from_document)
            .collect()
    }

    /// One job.
    pub async fn read_job(&self, path: &Path) -> Result<JobDocument> {
        Ok(JobDocument::from_document(self.jobs.read(path).await?))
    }

    /// Create a job in the backlog.
    #[instrument(skip(self, body), fields(workspace_id = %self.workspace_id))]
    pub async fn create_job(&self, title: &str, body: &str) -> Result<JobDocument> {
        let content = job::new_job_content(title, body, &now());
        let job = JobDocument::from_document(self.jobs.create(title, &content).await?);
        info!(path = %job.path.display(), "job created");
        self.broadcast_jobs().await;
        Ok(job)
    }

    /// Replace a job's content.
    pub async fn write_job(
        &self,
        path: &Path,
        content: &str,
        expected_version: Option<&str>,
    ) -> Result<JobDocument> {
        let job = JobDocument::from_document(self.jobs.write(path, content, expected_version).await?);
        self.broadcast_jobs().await;
        Ok(job)
    }

    /// Tick or untick one job task.
    pub async fn update_job_task(
        &self,
        path: &Path,
        line: usize,
        done: bool,
        expected_version: Option<&str>,
    ) -> Result<JobDocument> {
        let doc = self.jobs.update_task(path, line, done, expected_version).await?;
        self.broadcast_jobs().await;
        Ok(JobDocument::from_document(doc))
    }

    /// Move a job to `phase`, optionally recording the slot handling it.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id, path = %path.display()))]
    pub async fn set_job_phase(
        &self,
        path: &Path,
        phase: JobPhase,
        session: Option<&SlotId>,
    ) -> Result<JobDocument> {
        let stamp = now();
        let session_key = phase.session_key();
        let session = session.cloned();
        let doc = self
            .jobs
            .edit_frontmatter(path, None, move |fm| {
                job::apply_phase(fm, phase, &stamp);
                if let (Some(key), Some(slot)) = (session_key, session) {
                    fm.set(key, slot.into_inner());
                }
            })
            .await?;
        let job = JobDocument::from_document(doc);
        info!(phase = %job.phase, "job phase changed");
        self.broadcast_jobs().await;
        Ok(job)
    }

    /// Record that the finalize nudge was sent.
    pub async fn mark_job_finalized(&self, path: &Path) -> Result<JobDocument> {
        let stamp = now();
        let doc = self
            .jobs
            .edit_frontmatter(path, None, move |fm| {
                fm.set(keys::FINALIZED, "true");
                fm.set(keys::UPDATED_AT, stamp);
            })
            .await?;
        self.broadcast_jobs().await;
        Ok(JobDocument::from_document(doc))
    }

    /// Jobs in planning, executing, or review.
    pub async fn active_jobs(&self) -> Vec<JobDocument> {
        self.list_jobs()
            .await
            .into_iter()
            .filter(|j| j.phase.is_active())
            .collect()
    }

    /// Jobs whose execution or review runs on `slot`.
    pub async fn jobs_driven_by(&self, slot: &SlotId) -> Vec<JobDocument> {
        self.list_jobs()
            .await
            .into_iter()
            .filter(|j| j.is_driven_by(slot))
            .collect()
    }

    // ── Broadcast ───────────────────────────────────────────────────────

    fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.sink.deliver(WorkspaceEvent::new(
            event_type,
            self.workspace_id.clone(),
            None,
            data,
        ));
    }

    fn emit_plans(&self, plans: &[PlanDocument]) {
        let active = plans.iter().find(|p| p.is_active);
        self.emit(event_types::PLANS_UPDATED, json!({ "plans": plans }));
        self.emit(event_types::ACTIVE_PLAN, json!({ "plan": active }));
    }

    fn emit_jobs(&self, jobs: &[JobDocument]) {
        let active: Vec<&JobDocument> = jobs.iter().filter(|j| j.phase.is_active()).collect();
        self.emit(event_types::JOBS_UPDATED, json!({ "jobs": jobs }));
        self.emit(event_types::ACTIVE_JOBS, json!({ "jobs": active }));
    }

    /// Rescan plans and broadcast the list and active plan.
    pub async fn broadcast_plans(&self) {
        let plans = self.list_plans().await;
        self.emit_plans(&plans);
    }

    /// Rescan jobs and broadcast the list and active jobs.
    pub async fn broadcast_jobs(&self) {
        let jobs = self.list_jobs().await;
        self.emit_jobs(&jobs);
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    /// Bring in-memory state in line with the files on disk.
    ///
    /// Deactivates a vanished active plan, auto-completes fully ticked
    /// plans, broadcasts both lists, and records fingerprints for the poll.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn reconcile(&self) {
        if let Some(path) = self.active_plan_path() {
            if tokio::fs::metadata(&path).await.is_err() {
                info!(path = %path.display(), "active plan disappeared, deactivating");
                let _ = self.clear_active_if(&path);
            }
        }

        let mut plans = Vec::new();
        for plan in self.list_plans().await {
            plans.push(self.complete_plan_if_done(plan).await);
        }
        let jobs = self.list_jobs().await;

        self.emit_plans(&plans);
        self.emit_jobs(&jobs);
        self.record_fingerprints(&plans, &jobs);
    }

    fn record_fingerprints(&self, plans: &[PlanDocument], jobs: &[JobDocument]) {
        let tracked: HashMap<PathBuf, String> = plans
            .iter()
            .filter(|p| p.is_active)
            .map(|p| (p.path.clone(), fingerprint(&p.content)))
            .chain(
                jobs.iter()
                    .filter(|j| j.phase.is_active())
                    .map(|j| (j.path.clone(), fingerprint(&j.content))),
            )
            .collect();
        *self.fingerprints.lock() = tracked;
    }

    /// Re-read the active plan and active job files and report whether any
    /// fingerprint moved since the last reconciliation.
    pub async fn poll_changed(&self) -> bool {
        let mut tracked: Vec<(PathBuf, Option<String>)> = self
            .fingerprints
            .lock()
            .iter()
            .map(|(p, f)| (p.clone(), Some(f.clone())))
            .collect();
        if let Some(active) = self.active_plan_path() {
            if !tracked.iter().any(|(p, _)| *p == active) {
                tracked.push((active, None));
            }
        }

        for (path, previous) in tracked {
            let current = tokio::fs::read_to_string(&path)
                .await
                .map(|c| fingerprint(&c))
                .ok();
            if current != previous {
                debug!(path = %path.display(), "fingerprint changed");
                return true;
            }
        }
        false
    }
}
