//! Plan documents.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checklist::Task;
use crate::frontmatter::Frontmatter;
use crate::store::Document;

/// Plan lifecycle status, stored under the `status` header key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    /// Not being worked on.
    #[default]
    Draft,
    /// The workspace's current plan.
    Active,
    /// Every task done.
    Complete,
}

impl PlanStatus {
    /// Parse a header value; unknown values fall back to `Draft`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" | "in-progress" | "in_progress" => Self::Active,
            "complete" | "completed" | "done" => Self::Complete,
            _ => Self::Draft,
        }
    }

    /// Header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan as sent to clients.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    /// Absolute path.
    pub path: PathBuf,
    /// Title.
    pub title: String,
    /// Status.
    pub status: PlanStatus,
    /// Checklist tasks.
    pub tasks: Vec<Task>,
    /// Number of tasks.
    pub task_count: usize,
    /// Number of ticked tasks.
    pub done_count: usize,
    /// Whether this is the workspace's active plan.
    pub is_active: bool,
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Completion timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    /// Full header.
    pub frontmatter: Frontmatter,
    /// Content version for optimistic writes.
    pub version: String,
    /// Raw content.
    #[serde(skip)]
    pub content: String,
}

impl PlanDocument {
    /// Interpret a parsed document as a plan.
    pub fn from_document(doc: Document, is_active: bool) -> Self {
        let status = doc
            .frontmatter
            .get("status")
            .map(PlanStatus::parse)
            .unwrap_or_default();
        let created_at = doc.frontmatter.get_nonempty("createdAt").map(str::to_owned);
        let completed_at = doc.frontmatter.get_nonempty("completedAt").map(str::to_owned);
        Self {
            path: doc.path,
            title: doc.title,
            status,
            tasks: doc.tasks,
            task_count: doc.task_count,
            done_count: doc.done_count,
            is_active,
            created_at,
            completed_at,
            frontmatter: doc.frontmatter,
            version: doc.version,
            content: doc.content,
        }
    }

    /// Every task done, at least one task, and not yet marked complete.
    pub fn needs_completion(&self) -> bool {
        self.task_count > 0 && self.done_count == self.task_count && self.status != PlanStatus::Complete
    }
}

/// Header and body for a new plan.
pub fn new_plan_content(title: &str, body: &str, now: &str) -> String {
    let mut fm = Frontmatter::default();
    fm.set("title", title);
    fm.set("status", PlanStatus::Draft.as_str());
    fm.set("createdAt", now);
    let mut out = fm.render();
    if body.trim().is_empty() {
        out.push_str(&format!("# {title}\n\n- [ ] \n"));
    } else {
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
