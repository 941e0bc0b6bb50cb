//! # tether-docs
//!
//! Markdown plan and job documents living inside a workspace.
//!
//! - **Parsing**: `frontmatter` headers and `checklist` tasks
//! - **Storage**: [`DocStore`] with per-path locks, atomic writes, and
//!   content versions for optimistic concurrency
//! - **Semantics**: plan status and auto-completion, the job phase machine
//! - **Reconciliation**: [`DocsService`] plus the [`DocWatcher`] that keeps
//!   it in line with edits made outside the server

#![deny(unsafe_code)]

pub mod checklist;
pub mod errors;
pub mod frontmatter;
pub mod job;
pub mod plan;
pub mod prompts;
pub mod service;
pub mod store;
pub mod watcher;

pub use checklist::Task;
pub use errors::{DocError, Result};
pub use frontmatter::Frontmatter;
pub use job::{JobDocument, JobPhase, RunEndAction};
pub use plan::{PlanDocument, PlanStatus};
pub use service::DocsService;
pub use store::{DocStore, Document};
pub use watcher::DocWatcher;
