//! Job phase automation.
//!
//! Listens for finished agent runs and moves the jobs those runs were
//! driving: execution hands over to review (or completes), review gets one
//! finalize nudge and then completes. Manual promote and demote go through
//! the same slot bookkeeping.

use std::path::Path;
use std::sync::Arc;

use tether_core::SlotId;
use tether_docs::job::{self, JobDocument, JobPhase, RunEndAction};
use tether_docs::{DocError, DocsService, prompts};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::Result;
use crate::orchestrator::SessionOrchestrator;

/// Drives job phases for one workspace.
pub struct JobAutomation {
    docs: Arc<DocsService>,
    orchestrator: Arc<SessionOrchestrator>,
}

impl JobAutomation {
    /// Automation over `docs`, prompting through `orchestrator`.
    pub fn new(docs: Arc<DocsService>, orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self { docs, orchestrator }
    }

    /// Consume run-ended notifications until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.orchestrator.subscribe_run_ended();
        drop(tokio::spawn(async move {
            loop {
                let slot = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(slot) => slot,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "job automation lagged behind run-ended events");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                self.on_run_ended(&slot).await;
            }
            debug!(
                workspace_id = %self.orchestrator.workspace_id(),
                "job automation stopped"
            );
        }));
    }

    /// Apply the phase machine to every job driven by `slot`.
    #[instrument(skip(self), fields(workspace_id = %self.orchestrator.workspace_id()))]
    pub async fn on_run_ended(&self, slot: &SlotId) {
        for job in self.docs.jobs_driven_by(slot).await {
            let Some(action) = job::on_run_ended(&job, slot) else {
                continue;
            };
            let path = job.path.clone();
            let result = match action {
                RunEndAction::StartReview => self.enter_phase(&job, JobPhase::Review).await,
                RunEndAction::Complete => self
                    .docs
                    .set_job_phase(&job.path, JobPhase::Complete, None)
                    .await
                    .map_err(Into::into),
                RunEndAction::NudgeFinalize => self.nudge_finalize(&job).await,
            };
            match result {
                Ok(updated) => info!(
                    path = %path.display(),
                    ?action,
                    phase = %updated.phase,
                    "job advanced after run"
                ),
                Err(e) => warn!(path = %path.display(), ?action, error = %e, "job automation failed"),
            }
        }
    }

    /// Move a job one phase forward. Working phases get a slot and a prompt.
    #[instrument(skip(self), fields(workspace_id = %self.orchestrator.workspace_id(), path = %path.display()))]
    pub async fn promote(&self, path: &Path) -> Result<JobDocument> {
        let job = self.docs.read_job(path).await?;
        let next = job.phase.next().ok_or_else(|| {
            DocError::InvalidTransition(format!("{} is already complete", job.title))
        })?;
        if next.is_active() {
            self.enter_phase(&job, next).await
        } else {
            Ok(self.docs.set_job_phase(&job.path, next, None).await?)
        }
    }

    /// Move a job one phase back without prompting anyone.
    #[instrument(skip(self), fields(workspace_id = %self.orchestrator.workspace_id(), path = %path.display()))]
    pub async fn demote(&self, path: &Path) -> Result<JobDocument> {
        let job = self.docs.read_job(path).await?;
        let previous = job.phase.previous().ok_or_else(|| {
            DocError::InvalidTransition(format!("{} is still in the backlog", job.title))
        })?;
        Ok(self.docs.set_job_phase(&job.path, previous, None).await?)
    }

    /// Reuse or create the phase's slot, record it, then prompt it.
    async fn enter_phase(&self, job: &JobDocument, phase: JobPhase) -> Result<JobDocument> {
        let slot = job
            .session_for(phase)
            .cloned()
            .unwrap_or_else(|| SlotId::generate(phase.slot_prefix()));
        let _ = self.orchestrator.create_slot(Some(slot.clone())).await?;
        // Persist before prompting so the run that follows sees the new phase.
        let updated = self.docs.set_job_phase(&job.path, phase, Some(&slot)).await?;
        if let Some(prompt) = prompts::phase_prompt(&updated, phase) {
            self.orchestrator.prompt(&slot, &prompt, Vec::new()).await?;
        }
        Ok(updated)
    }

    async fn nudge_finalize(&self, job: &JobDocument) -> Result<JobDocument> {
        let updated = self.docs.mark_job_finalized(&job.path).await?;
        if let Some(slot) = &job.review_session_id {
            self.orchestrator
                .prompt(slot, &prompts::finalize_prompt(job), Vec::new())
                .await?;
        }
        Ok(updated)
    }
}
