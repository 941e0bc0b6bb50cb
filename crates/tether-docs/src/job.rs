//! Job documents and the phase machine.
//!
//! Phases are strictly ordered `backlog → planning → executing → review →
//! complete`. Each working phase records the slot handling it so a later
//! promotion can reuse the conversation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tether_core::SlotId;

use crate::checklist::{self, Task};
use crate::frontmatter::Frontmatter;
use crate::store::Document;

/// Header keys written by the phase machine.
pub mod keys {
    /// Current phase.
    pub const PHASE: &str = "phase";
    /// Slot of the planning conversation.
    pub const PLANNING_SESSION: &str = "planningSessionId";
    /// Slot of the execution conversation.
    pub const EXECUTION_SESSION: &str = "executionSessionId";
    /// Slot of the review conversation.
    pub const REVIEW_SESSION: &str = "reviewSessionId";
    /// Review finalize nudge already sent.
    pub const FINALIZED: &str = "finalized";
    /// Creation time.
    pub const CREATED_AT: &str = "createdAt";
    /// Last phase change.
    pub const UPDATED_AT: &str = "updatedAt";
    /// Completion time.
    pub const COMPLETED_AT: &str = "completedAt";
}

/// Job phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Not started.
    #[default]
    Backlog,
    /// Being planned.
    Planning,
    /// Being executed.
    Executing,
    /// Being reviewed.
    Review,
    /// Done.
    Complete,
}

impl JobPhase {
    /// Parse a header value; unknown values fall back to `Backlog`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "planning" => Self::Planning,
            "executing" | "execution" => Self::Executing,
            "review" | "reviewing" => Self::Review,
            "complete" | "completed" | "done" => Self::Complete,
            _ => Self::Backlog,
        }
    }

    /// Header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Review => "review",
            Self::Complete => "complete",
        }
    }

    /// Following phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Backlog => Some(Self::Planning),
            Self::Planning => Some(Self::Executing),
            Self::Executing => Some(Self::Review),
            Self::Review => Some(Self::Complete),
            Self::Complete => None,
        }
    }

    /// Preceding phase, if any.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Backlog => None,
            Self::Planning => Some(Self::Backlog),
            Self::Executing => Some(Self::Planning),
            Self::Review => Some(Self::Executing),
            Self::Complete => Some(Self::Review),
        }
    }

    /// Planning, executing, or review.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Planning | Self::Executing | Self::Review)
    }

    /// Header key holding this phase's slot id.
    pub fn session_key(self) -> Option<&'static str> {
        match self {
            Self::Planning => Some(keys::PLANNING_SESSION),
            Self::Executing => Some(keys::EXECUTION_SESSION),
            Self::Review => Some(keys::REVIEW_SESSION),
            Self::Backlog | Self::Complete => None,
        }
    }

    /// Prefix for generated slot ids.
    pub fn slot_prefix(self) -> &'static str {
        match self {
            Self::Planning => "plan",
            Self::Executing => "exec",
            Self::Review => "review",
            Self::Backlog | Self::Complete => "job",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job as sent to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    /// Absolute path.
    pub path: PathBuf,
    /// Title.
    pub title: String,
    /// Phase.
    pub phase: JobPhase,
    /// Checklist tasks.
    pub tasks: Vec<Task>,
    /// Number of tasks.
    pub task_count: usize,
    /// Number of ticked tasks.
    pub done_count: usize,
    /// Planning slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning_session_id: Option<SlotId>,
    /// Execution slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_session_id: Option<SlotId>,
    /// Review slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_session_id: Option<SlotId>,
    /// Finalize nudge sent during review.
    pub finalized: bool,
    /// Body has a Review heading.
    pub has_review: bool,
    /// Full header.
    pub frontmatter: Frontmatter,
    /// Content version for optimistic writes.
    pub version: String,
    /// Raw content.
    #[serde(skip)]
    pub content: String,
}

impl JobDocument {
    /// Interpret a parsed document as a job.
    pub fn from_document(doc: Document) -> Self {
        let fm = &doc.frontmatter;
        let slot = |key: &str| fm.get_nonempty(key).map(SlotId::from);
        let phase = fm.get(keys::PHASE).map(JobPhase::parse).unwrap_or_default();
        let planning_session_id = slot(keys::PLANNING_SESSION);
        let execution_session_id = slot(keys::EXECUTION_SESSION);
        let review_session_id = slot(keys::REVIEW_SESSION);
        let finalized = fm
            .get(keys::FINALIZED)
            .is_some_and(|v| matches!(v.trim(), "true" | "yes" | "1"));
        let has_review = checklist::has_review_section(doc.body());
        Self {
            path: doc.path,
            title: doc.title,
            phase,
            tasks: doc.tasks,
            task_count: doc.task_count,
            done_count: doc.done_count,
            planning_session_id,
            execution_session_id,
            review_session_id,
            finalized,
            has_review,
            frontmatter: doc.frontmatter,
            version: doc.version,
            content: doc.content,
        }
    }

    /// Slot recorded for `phase`.
    pub fn session_for(&self, phase: JobPhase) -> Option<&SlotId> {
        match phase {
            JobPhase::Planning => self.planning_session_id.as_ref(),
            JobPhase::Executing => self.execution_session_id.as_ref(),
            JobPhase::Review => self.review_session_id.as_ref(),
            JobPhase::Backlog | JobPhase::Complete => None,
        }
    }

    /// Whether `slot` runs this job's execution or review.
    pub fn is_driven_by(&self, slot: &SlotId) -> bool {
        self.execution_session_id.as_ref() == Some(slot)
            || self.review_session_id.as_ref() == Some(slot)
    }
}

/// What to do when a job's conversation finishes a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEndAction {
    /// Move to review and prompt the review conversation.
    StartReview,
    /// Mark the job complete.
    Complete,
    /// Ask the review conversation to finalize, stay in review.
    NudgeFinalize,
}

/// Decide the phase-machine step for a run that ended on `slot`.
///
/// Only the conversation recorded for the job's current phase can move it.
pub fn on_run_ended(job: &JobDocument, slot: &SlotId) -> Option<RunEndAction> {
    match job.phase {
        JobPhase::Executing if job.execution_session_id.as_ref() == Some(slot) => {
            if job.has_review {
                Some(RunEndAction::StartReview)
            } else {
                Some(RunEndAction::Complete)
            }
        }
        JobPhase::Review if job.review_session_id.as_ref() == Some(slot) => {
            if job.finalized {
                Some(RunEndAction::Complete)
            } else {
                Some(RunEndAction::NudgeFinalize)
            }
        }
        _ => None,
    }
}

/// Header and body for a new job in the backlog.
pub fn new_job_content(title: &str, body: &str, now: &str) -> String {
    let mut fm = Frontmatter::default();
    fm.set("title", title);
    fm.set(keys::PHASE, JobPhase::Backlog.as_str());
    fm.set(keys::CREATED_AT, now);
    fm.set(keys::UPDATED_AT, now);
    let mut out = fm.render();
    if body.trim().is_empty() {
        out.push_str(&format!("# {title}\n\n## Tasks\n\n- [ ] \n"));
    } else {
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Header edit moving a job to `phase` at time `now`.
pub fn apply_phase(fm: &mut Frontmatter, phase: JobPhase, now: &str) {
    fm.set(keys::PHASE, phase.as_str());
    fm.set(keys::UPDATED_AT, now);
    if phase == JobPhase::Complete {
        fm.set(keys::COMPLETED_AT, now);
    } else {
        let _ = fm.remove(keys::COMPLETED_AT);
    }
    if phase < JobPhase::Review {
        let _ = fm.remove(keys::FINALIZED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn job(content: &str) -> JobDocument {
        JobDocument::from_document(Document::parse(Path::new("/w/j.md"), content.into()))
    }

    const EXECUTING_WITH_REVIEW: &str = "---\nphase: executing\nexecutionSessionId: exec-1\n---\n# Job\n- [x] a\n\n## Review\n- [ ] check\n";
    const EXECUTING_NO_REVIEW: &str = "---\nphase: executing\nexecutionSessionId: exec-1\n---\n# Job\n- [x] a\n";

    #[test]
    fn phase_order() {
        assert!(JobPhase::Backlog < JobPhase::Planning);
        assert!(JobPhase::Review < JobPhase::Complete);
        assert_eq!(JobPhase::Executing.next(), Some(JobPhase::Review));
        assert_eq!(JobPhase::Complete.next(), None);
        assert_eq!(JobPhase::Backlog.previous(), None);
        assert_eq!(JobPhase::Review.previous(), Some(JobPhase::Executing));
    }

    #[test]
    fn active_phases() {
        let active: Vec<_> = [
            JobPhase::Backlog,
            JobPhase::Planning,
            JobPhase::Executing,
            JobPhase::Review,
            JobPhase::Complete,
        ]
        .into_iter()
        .filter(|p| p.is_active())
        .collect();
        assert_eq!(active, vec![JobPhase::Planning, JobPhase::Executing, JobPhase::Review]);
    }

    #[test]
    fn parses_session_ids_and_flags() {
        let j = job("---\nphase: review\nreviewSessionId: r-1\nfinalized: true\n---\n## Review\n");
        assert_eq!(j.phase, JobPhase::Review);
        assert_eq!(j.review_session_id, Some(SlotId::from("r-1")));
        assert!(j.finalized);
        assert!(j.has_review);
        assert!(j.is_driven_by(&SlotId::from("r-1")));
    }

    #[test]
    fn malformed_phase_defaults_to_backlog() {
        assert_eq!(job("---\nphase: ???\n---\n").phase, JobPhase::Backlog);
        assert_eq!(job("no header").phase, JobPhase::Backlog);
    }

    #[test]
    fn executing_with_review_starts_review() {
        let j = job(EXECUTING_WITH_REVIEW);
        assert_eq!(on_run_ended(&j, &SlotId::from("exec-1")), Some(RunEndAction::StartReview));
    }

    #[test]
    fn executing_without_review_completes() {
        let j = job(EXECUTING_NO_REVIEW);
        assert_eq!(on_run_ended(&j, &SlotId::from("exec-1")), Some(RunEndAction::Complete));
    }

    #[test]
    fn review_nudges_then_completes() {
        let nudge = job("---\nphase: review\nreviewSessionId: r\n---\n## Review\n");
        assert_eq!(on_run_ended(&nudge, &SlotId::from("r")), Some(RunEndAction::NudgeFinalize));
        let done = job("---\nphase: review\nreviewSessionId: r\nfinalized: true\n---\n## Review\n");
        assert_eq!(on_run_ended(&done, &SlotId::from("r")), Some(RunEndAction::Complete));
    }

    #[test]
    fn unrelated_slot_does_nothing() {
        let j = job(EXECUTING_WITH_REVIEW);
        assert_eq!(on_run_ended(&j, &SlotId::from("default")), None);
        let planning = job("---\nphase: planning\nexecutionSessionId: exec-1\n---\n");
        assert_eq!(on_run_ended(&planning, &SlotId::from("exec-1")), None);
    }

    #[test]
    fn apply_phase_sets_timestamps() {
        let mut fm = Frontmatter::default();
        apply_phase(&mut fm, JobPhase::Complete, "t1");
        assert_eq!(fm.get(keys::COMPLETED_AT), Some("t1"));
        fm.set(keys::FINALIZED, "true");
        apply_phase(&mut fm, JobPhase::Executing, "t2");
        assert_eq!(fm.get(keys::COMPLETED_AT), None);
        assert_eq!(fm.get(keys::FINALIZED), None);
        assert_eq!(fm.get(keys::UPDATED_AT), Some("t2"));
    }

    #[test]
    fn new_job_starts_in_backlog() {
        let j = job(&new_job_content("Add search", "", "now"));
        assert_eq!(j.phase, JobPhase::Backlog);
        assert_eq!(j.title, "Add search");
    }
}
