//! # tether-runtime
//!
//! Workspaces, their conversation slots, and the glue that keeps both in
//! step with plan and job documents.
//!
//! - **Runtime seam**: [`SessionRuntime`] and [`RuntimeFactory`], with a
//!   subprocess implementation in [`process`]
//! - **Slots**: [`SessionOrchestrator`] owns one runtime per slot, shares a
//!   single initialization between concurrent callers, and pumps runtime
//!   events into the workspace in order
//! - **UI requests**: [`UiBridge`] raises extension and questionnaire
//!   requests; answers are routed back through the [`RequestRouter`]
//! - **Workspaces**: [`WorkspaceManager`] with attach counts and an
//!   [`Outbox`] that buffers while nobody is listening
//! - **Automation**: [`JobAutomation`] advances job phases as runs end

#![deny(unsafe_code)]

pub mod automation;
pub mod buffer;
pub mod errors;
pub mod orchestrator;
pub mod process;
pub mod runtime;
pub mod slot;
pub mod ui;
pub mod workspace;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use automation::JobAutomation;
pub use buffer::EventBuffer;
pub use errors::{Result, RuntimeError};
pub use orchestrator::{SessionOrchestrator, SlotSnapshot};
pub use process::{ProcessRuntime, ProcessRuntimeFactory};
pub use runtime::{
    ModelRef, QueueState, RuntimeContext, RuntimeFactory, SessionRuntime, SessionState,
    SessionSummary,
};
pub use slot::SlotInfo;
pub use ui::{RequestRouter, UiBridge, UiRequest, UiRequestKind, UiRequestRecord, UiResponse};
pub use workspace::{
    ManagerConfig, OpenWorkspace, Outbox, Workspace, WorkspaceInfo, WorkspaceManager,
    WorkspaceObserver,
};
