//! The session runtime collaborator.
//!
//! A [`SessionRuntime`] is one agent conversation: it runs prompts, keeps
//! the transcript, and reports progress as [`RuntimeEvent`]s. The
//! orchestrator only ever talks to runtimes through this trait.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::{RuntimeEvent, SlotId, WorkspaceId};
use tokio::sync::broadcast;

use crate::errors::Result;
use crate::ui::UiBridge;

/// Model selection as reported by a runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    /// Provider name.
    pub provider: String,
    /// Model id within the provider.
    pub id: String,
}

/// Snapshot of a runtime's conversation state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Loaded session file.
    pub session_file: Option<String>,
    /// Session id inside the file.
    pub session_id: Option<String>,
    /// Current model.
    pub model: Option<ModelRef>,
    /// Current thinking level.
    pub thinking_level: Option<String>,
    /// A run is in progress.
    pub is_streaming: bool,
    /// Transcript length.
    pub message_count: usize,
}

/// Saved session as listed by a runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSummary {
    /// Session file path.
    pub path: String,
    /// Session id.
    pub id: String,
    /// Display name or first user message.
    pub name: Option<String>,
    /// Number of messages.
    pub message_count: usize,
    /// Last modification time (RFC 3339).
    pub modified: Option<String>,
}

/// Text waiting to be delivered to the agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueState {
    /// Steering messages, delivered mid-run.
    pub steering: Vec<String>,
    /// Follow-up messages, delivered after the run.
    pub follow_up: Vec<String>,
}

/// One agent conversation.
#[async_trait]
pub trait SessionRuntime: Send + Sync {
    /// Start the conversation. Called exactly once per runtime.
    async fn initialize(&self) -> Result<()>;

    /// Current state.
    async fn state(&self) -> Result<SessionState>;

    /// Transcript, oldest first.
    async fn messages(&self) -> Result<Vec<Value>>;

    /// Start a run with a user message.
    async fn prompt(&self, text: &str, images: Vec<Value>) -> Result<()>;

    /// Queue a steering message for the running turn.
    async fn steer(&self, text: &str) -> Result<()>;

    /// Queue a message for after the current run.
    async fn follow_up(&self, text: &str) -> Result<()>;

    /// Stop the current run.
    async fn abort(&self) -> Result<()>;

    /// Switch model.
    async fn set_model(&self, provider: &str, model_id: &str) -> Result<Value>;

    /// Set the thinking level.
    async fn set_thinking_level(&self, level: &str) -> Result<()>;

    /// Advance to the next configured model.
    async fn cycle_model(&self) -> Result<Value>;

    /// Start a fresh session file.
    async fn new_session(&self) -> Result<Value>;

    /// Load another session file.
    async fn switch_session(&self, path: &str) -> Result<Value>;

    /// Summarize older context.
    async fn compact(&self, instructions: Option<&str>) -> Result<Value>;

    /// Branch the conversation from an earlier entry.
    async fn fork(&self, entry_id: &str) -> Result<Value>;

    /// Saved sessions for this working directory.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>>;

    /// Pending steering and follow-up text.
    async fn queued_messages(&self) -> Result<QueueState>;

    /// Event stream. Subscribers only see events sent after subscribing.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;

    /// Release the runtime. Must tolerate repeated calls.
    async fn dispose(&self);
}

/// Everything a factory needs to build a runtime for one slot.
#[derive(Clone)]
pub struct RuntimeContext {
    /// Workspace root, the runtime's working directory.
    pub cwd: PathBuf,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Slot the runtime serves.
    pub slot_id: SlotId,
    /// Channel for extension UI and questionnaire requests.
    pub ui: UiBridge,
}

/// Builds runtimes for new slots.
pub trait RuntimeFactory: Send + Sync {
    /// Construct, without initializing, a runtime for `ctx`.
    fn create(&self, ctx: RuntimeContext) -> Result<Arc<dyn SessionRuntime>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_tolerates_partial_payloads() {
        let state: SessionState =
            serde_json::from_value(json!({"sessionFile": "/s/a.jsonl", "isStreaming": true}))
                .unwrap();
        assert_eq!(state.session_file.as_deref(), Some("/s/a.jsonl"));
        assert!(state.is_streaming);
        assert_eq!(state.message_count, 0);
    }

    #[test]
    fn queue_serializes_camel_case() {
        let queue = QueueState {
            steering: vec!["a".into()],
            follow_up: vec!["b".into()],
        };
        let value = serde_json::to_value(queue).unwrap();
        assert_eq!(value, json!({"steering": ["a"], "followUp": ["b"]}));
    }
}
