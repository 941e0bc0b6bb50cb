//! Event vocabulary.
//!
//! Two layers:
//!
//! - **[`RuntimeEvent`]**: what a session runtime emits for one conversation
//!   (message streaming, tool execution, run boundaries).
//! - **[`WorkspaceEvent`]**: the envelope clients receive. Every event is
//!   scoped to a workspace and, when it comes from a conversation, to the
//!   slot that produced it.
//!
//! Delivery goes through [`EventSink`], an observer with no unsubscribe
//! protocol: whoever owns the sink decides where events go.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{SlotId, WorkspaceId};

/// Event type names produced by the orchestration layer itself.
pub mod event_types {
    /// Queue state of a slot after the runtime accepted or consumed input.
    pub const QUEUED_MESSAGES: &str = "queuedMessages";
    /// A slot finished initializing.
    pub const SLOT_CREATED: &str = "slotCreated";
    /// A slot was closed.
    pub const SLOT_CLOSED: &str = "slotClosed";
    /// Extension UI request awaiting a client answer.
    pub const EXTENSION_UI_REQUEST: &str = "extensionUiRequest";
    /// Questionnaire awaiting client answers.
    pub const QUESTIONNAIRE_REQUEST: &str = "questionnaireRequest";
    /// A pending UI request was answered, timed out, or cancelled.
    pub const UI_REQUEST_SETTLED: &str = "uiRequestSettled";
    /// Refreshed plan list.
    pub const PLANS_UPDATED: &str = "plansUpdated";
    /// Active plan snapshot (`null` data when none).
    pub const ACTIVE_PLAN: &str = "activePlan";
    /// Refreshed job list.
    pub const JOBS_UPDATED: &str = "jobsUpdated";
    /// Jobs in planning, executing, or review.
    pub const ACTIVE_JOBS: &str = "activeJobs";
    /// The workspace is about to be torn down.
    pub const WORKSPACE_CLOSED: &str = "workspaceClosed";
}

/// Events emitted by a session runtime for a single conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RuntimeEvent {
    /// A run started.
    AgentStart,
    /// A run ended.
    AgentEnd {
        /// Messages produced by the run.
        #[serde(default)]
        messages: Vec<Value>,
    },
    /// A turn started.
    TurnStart,
    /// A turn ended.
    TurnEnd {
        /// The assistant message closing the turn, if any.
        #[serde(default)]
        message: Option<Value>,
    },
    /// A message began streaming.
    MessageStart {
        /// Message payload; carries a `role` field.
        message: Value,
    },
    /// Incremental message content.
    MessageUpdate {
        /// Message as accumulated so far.
        message: Value,
        /// The increment, when the runtime reports one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<Value>,
    },
    /// A message finished.
    MessageEnd {
        /// Final message payload.
        message: Value,
    },
    /// A tool call started executing.
    ToolStart {
        /// Tool call identifier.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Arguments.
        #[serde(default)]
        args: Value,
    },
    /// Partial tool output.
    ToolUpdate {
        /// Tool call identifier.
        tool_call_id: String,
        /// Partial result.
        #[serde(default)]
        partial_result: Value,
    },
    /// A tool call finished.
    ToolEnd {
        /// Tool call identifier.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Result payload.
        #[serde(default)]
        result: Value,
        /// Whether the tool failed.
        #[serde(default)]
        is_error: bool,
    },
    /// Runtime-level error surfaced to clients.
    Error {
        /// Description.
        message: String,
    },
    /// Runtime-specific event passed through untouched.
    Custom {
        /// Original event name.
        name: String,
        /// Original payload.
        #[serde(default)]
        data: Value,
    },
}

impl RuntimeEvent {
    /// Wire name of this event.
    pub fn event_type(&self) -> &str {
        match self {
            Self::AgentStart => "agentStart",
            Self::AgentEnd { .. } => "agentEnd",
            Self::TurnStart => "turnStart",
            Self::TurnEnd { .. } => "turnEnd",
            Self::MessageStart { .. } => "messageStart",
            Self::MessageUpdate { .. } => "messageUpdate",
            Self::MessageEnd { .. } => "messageEnd",
            Self::ToolStart { .. } => "toolStart",
            Self::ToolUpdate { .. } => "toolUpdate",
            Self::ToolEnd { .. } => "toolEnd",
            Self::Error { .. } => "error",
            Self::Custom { name, .. } => name,
        }
    }

    /// Whether this is the start of a user-authored message.
    pub fn is_user_message_start(&self) -> bool {
        matches!(
            self,
            Self::MessageStart { message }
                if message.get("role").and_then(Value::as_str) == Some("user")
        )
    }

    /// Payload without the `type` tag.
    pub fn data(&self) -> Value {
        if let Self::Custom { data, .. } = self {
            return data.clone();
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                let _ = map.remove("type");
                Value::Object(map)
            }
            _ => Value::Object(Map::new()),
        }
    }
}

/// Envelope delivered to clients, scoped by `{workspaceId, sessionSlotId?}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceEvent {
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Producing slot, for conversation events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_slot_id: Option<SlotId>,
    /// RFC 3339 emission time.
    pub timestamp: String,
    /// Payload.
    pub data: Value,
}

impl WorkspaceEvent {
    /// Build an event stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        workspace_id: WorkspaceId,
        session_slot_id: Option<SlotId>,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            workspace_id,
            session_slot_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Tag a runtime event with its workspace and slot.
    pub fn from_runtime(workspace_id: WorkspaceId, slot_id: SlotId, event: &RuntimeEvent) -> Self {
        Self::new(event.event_type(), workspace_id, Some(slot_id), event.data())
    }
}

/// Receives workspace events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Take ownership of one event.
    fn deliver(&self, event: WorkspaceEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn deliver(&self, _event: WorkspaceEvent) {}
}

/// Sink that keeps every delivered event in memory.
#[cfg(any(test, feature = "testutil"))]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<WorkspaceEvent>>,
}

#[cfg(any(test, feature = "testutil"))]
impl RecordingSink {
    /// Snapshot of everything delivered so far.
    pub fn events(&self) -> Vec<WorkspaceEvent> {
        self.events.lock().clone()
    }

    /// Events of one type, in delivery order.
    pub fn of_type(&self, event_type: &str) -> Vec<WorkspaceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[cfg(any(test, feature = "testutil"))]
impl EventSink for RecordingSink {
    fn deliver(&self, event: WorkspaceEvent) {
        self.events.lock().push(event);
    }
}
