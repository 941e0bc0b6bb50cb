//! Session runtime backed by an agent subprocess speaking JSON lines.
//!
//! Commands go to stdin as `{"id", "type", ...}`. The agent answers with
//! `{"type": "response", "id", "success", "data" | "error"}`; every other
//! line is an event. `extension_ui_request` and `questionnaire_request`
//! lines are routed through the slot's [`UiBridge`] and answered on stdin.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tether_core::{RequestId, RuntimeEvent};
use tether_settings::AgentSettings;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{Result, RuntimeError};
use crate::runtime::{
    QueueState, RuntimeContext, RuntimeFactory, SessionRuntime, SessionState, SessionSummary,
};
use crate::ui::{UiBridge, UiRequest, UiRequestKind, UiResponse};

const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const KILL_GRACE: Duration = Duration::from_secs(2);

type Writer = Arc<Mutex<Option<FramedWrite<ChildStdin, LinesCodec>>>>;
type Replies = Arc<DashMap<String, oneshot::Sender<Reply>>>;

#[derive(Debug)]
struct Reply {
    success: bool,
    data: Value,
    error: Option<String>,
}

/// Builds a [`ProcessRuntime`] per slot from the agent settings.
#[derive(Clone, Debug)]
pub struct ProcessRuntimeFactory {
    command: String,
    args: Vec<String>,
    request_timeout: Duration,
}

impl ProcessRuntimeFactory {
    /// Factory spawning `settings.command`.
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            request_timeout: Duration::from_secs(settings.request_timeout_secs.max(1)),
        }
    }
}

impl RuntimeFactory for ProcessRuntimeFactory {
    fn create(&self, ctx: RuntimeContext) -> Result<Arc<dyn SessionRuntime>> {
        Ok(Arc::new(ProcessRuntime::new(
            ctx,
            self.command.clone(),
            self.args.clone(),
            self.request_timeout,
        )))
    }
}

/// One agent subprocess serving one slot.
pub struct ProcessRuntime {
    ctx: RuntimeContext,
    command: String,
    args: Vec<String>,
    request_timeout: Duration,
    events: broadcast::Sender<RuntimeEvent>,
    replies: Replies,
    writer: Writer,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl ProcessRuntime {
    /// Runtime that spawns `command args..` in the workspace root on
    /// `initialize`.
    pub fn new(
        ctx: RuntimeContext,
        command: String,
        args: Vec<String>,
        request_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ctx,
            command,
            args,
            request_timeout,
            events,
            replies: Arc::new(DashMap::new()),
            writer: Arc::new(Mutex::new(None)),
            child: Mutex::new(None),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    async fn call(&self, kind: &str, params: Value) -> Result<Value> {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut command = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                let _ = map.insert("params".into(), other);
                map
            }
        };
        let _ = command.insert("id".into(), Value::String(id.clone()));
        let _ = command.insert("type".into(), Value::String(kind.to_owned()));

        let (tx, rx) = oneshot::channel();
        let _ = self.replies.insert(id.clone(), tx);
        if let Err(e) = write_line(&self.writer, &Value::Object(command)).await {
            let _ = self.replies.remove(&id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(RuntimeError::Runtime(format!(
                    "agent exited before answering {kind}"
                )));
            }
            Err(_) => {
                let _ = self.replies.remove(&id);
                return Err(RuntimeError::Runtime(format!(
                    "{kind} timed out after {}s",
                    self.request_timeout.as_secs()
                )));
            }
        };
        if reply.success {
            Ok(reply.data)
        } else {
            Err(RuntimeError::Runtime(
                reply.error.unwrap_or_else(|| format!("{kind} failed")),
            ))
        }
    }

    async fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        params: Value,
        field: Option<&str>,
    ) -> Result<T> {
        let data = self.call(kind, params).await?;
        let value = match field {
            Some(field) => data.get(field).cloned().unwrap_or(Value::Null),
            None => data,
        };
        serde_json::from_value(value)
            .map_err(|e| RuntimeError::Runtime(format!("malformed {kind} reply: {e}")))
    }
}

async fn write_line(writer: &Writer, value: &Value) -> Result<()> {
    let line = serde_json::to_string(value).map_err(|e| RuntimeError::Internal(e.to_string()))?;
    let mut guard = writer.lock().await;
    let sink = guard
        .as_mut()
        .ok_or_else(|| RuntimeError::InvalidOperation("agent process is not running".into()))?;
    sink.send(line)
        .await
        .map_err(|e| RuntimeError::Io(format!("write to agent failed: {e}")))
}

#[async_trait]
impl SessionRuntime for ProcessRuntime {
    async fn initialize(&self) -> Result<()> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.ctx.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::Initialization(format!("failed to spawn {}: {e}", self.command))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::Initialization(
                "agent stdio was not captured".into(),
            ));
        };
        if let Some(stderr) = child.stderr.take() {
            let slot_id = self.ctx.slot_id.clone();
            let cancel = self.cancel.clone();
            drop(tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        line = lines.next() => match line {
                            Some(Ok(line)) => debug!(slot_id = %slot_id, "agent: {line}"),
                            _ => break,
                        },
                    }
                }
            }));
        }

        *self.writer.lock().await = Some(FramedWrite::new(
            stdin,
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        ));
        *self.child.lock().await = Some(child);

        let reader = Reader {
            lines: FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            events: self.events.clone(),
            replies: Arc::clone(&self.replies),
            writer: Arc::clone(&self.writer),
            ui: self.ctx.ui.clone(),
            cancel: self.cancel.clone(),
            running: false,
        };
        drop(tokio::spawn(reader.run()));

        info!(
            workspace_id = %self.ctx.workspace_id,
            slot_id = %self.ctx.slot_id,
            command = %self.command,
            "agent process started"
        );
        Ok(())
    }

    async fn state(&self) -> Result<SessionState> {
        self.call_as("get_state", Value::Null, None).await
    }

    async fn messages(&self) -> Result<Vec<Value>> {
        self.call_as("get_messages", Value::Null, Some("messages")).await
    }

    async fn prompt(&self, text: &str, images: Vec<Value>) -> Result<()> {
        let mut params = json!({ "message": text });
        if !images.is_empty() {
            params["images"] = Value::Array(images);
        }
        let _ = self.call("prompt", params).await?;
        Ok(())
    }

    async fn steer(&self, text: &str) -> Result<()> {
        let _ = self.call("steer", json!({ "message": text })).await?;
        Ok(())
    }

    async fn follow_up(&self, text: &str) -> Result<()> {
        let _ = self.call("follow_up", json!({ "message": text })).await?;
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        let _ = self.call("abort", Value::Null).await?;
        Ok(())
    }

    async fn set_model(&self, provider: &str, model_id: &str) -> Result<Value> {
        self.call("set_model", json!({ "provider": provider, "modelId": model_id }))
            .await
    }

    async fn set_thinking_level(&self, level: &str) -> Result<()> {
        let _ = self
            .call("set_thinking_level", json!({ "level": level }))
            .await?;
        Ok(())
    }

    async fn cycle_model(&self) -> Result<Value> {
        self.call("cycle_model", Value::Null).await
    }

    async fn new_session(&self) -> Result<Value> {
        self.call("new_session", Value::Null).await
    }

    async fn switch_session(&self, path: &str) -> Result<Value> {
        self.call("switch_session", json!({ "sessionPath": path }))
            .await
    }

    async fn compact(&self, instructions: Option<&str>) -> Result<Value> {
        let params = match instructions {
            Some(text) => json!({ "customInstructions": text }),
            None => Value::Null,
        };
        self.call("compact", params).await
    }

    async fn fork(&self, entry_id: &str) -> Result<Value> {
        self.call("fork", json!({ "entryId": entry_id })).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.call_as("list_sessions", Value::Null, Some("sessions"))
            .await
    }

    async fn queued_messages(&self) -> Result<QueueState> {
        self.call_as("get_queued_messages", Value::Null, None).await
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) {
        self.cancel.cancel();
        drop(self.writer.lock().await.take());
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(slot_id = %self.ctx.slot_id, error = %e, "agent already exited");
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                warn!(slot_id = %self.ctx.slot_id, "agent did not exit after kill");
            }
        }
        self.replies.clear();
    }
}

struct Reader {
    lines: FramedRead<tokio::process::ChildStdout, LinesCodec>,
    events: broadcast::Sender<RuntimeEvent>,
    replies: Replies,
    writer: Writer,
    ui: UiBridge,
    cancel: CancellationToken,
    /// Between `agent_start` and `agent_end`.
    running: bool,
}

impl Reader {
    async fn run(mut self) {
        loop {
            let line = tokio::select! {
                () = self.cancel.cancelled() => break,
                line = self.lines.next() => line,
            };
            match line {
                Some(Ok(line)) => self.handle(&line),
                Some(Err(e)) => warn!(slot_id = %self.ui.slot_id(), error = %e, "unreadable agent line"),
                None => {
                    if !self.cancel.is_cancelled() {
                        let _ = self.events.send(RuntimeEvent::Error {
                            message: "agent process exited".into(),
                        });
                        if self.running {
                            warn!(slot_id = %self.ui.slot_id(), "agent exited mid-run");
                            let _ = self.events.send(RuntimeEvent::AgentEnd {
                                messages: Vec::new(),
                            });
                        }
                    }
                    break;
                }
            }
        }
        // Dropping the senders fails every in-flight call.
        self.replies.clear();
    }

    fn handle(&mut self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(slot_id = %self.ui.slot_id(), error = %e, "non-JSON agent output ignored");
                return;
            }
        };
        match value.get("type").and_then(Value::as_str) {
            Some("response") => self.settle(&value),
            Some("extension_ui_request") => self.forward_ui(value, UiRequestKind::Extension),
            Some("questionnaire_request") => {
                self.forward_ui(value, UiRequestKind::Questionnaire);
            }
            _ => {
                let event = normalize_event(value);
                match event {
                    RuntimeEvent::AgentStart => self.running = true,
                    RuntimeEvent::AgentEnd { .. } => self.running = false,
                    _ => {}
                }
                let _ = self.events.send(event);
            }
        }
    }

    fn settle(&self, value: &Value) {
        let Some(id) = value.get("id").and_then(Value::as_str) else {
            debug!("agent response without id");
            return;
        };
        let Some((_, tx)) = self.replies.remove(id) else {
            debug!(id, "late agent response ignored");
            return;
        };
        let _ = tx.send(Reply {
            success: value.get("success").and_then(Value::as_bool).unwrap_or(false),
            data: value.get("data").cloned().unwrap_or(Value::Null),
            error: value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned),
        });
    }

    fn forward_ui(&self, value: Value, kind: UiRequestKind) {
        let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_owned) else {
            debug!("UI request without id ignored");
            return;
        };
        let method = value
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or(match kind {
                UiRequestKind::Extension => "extension",
                UiRequestKind::Questionnaire => "questionnaire",
            })
            .to_owned();
        let timeout = value
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        let reply_type = match kind {
            UiRequestKind::Extension => "extension_ui_response",
            UiRequestKind::Questionnaire => "questionnaire_response",
        };
        let ui = self.ui.clone();
        let writer = Arc::clone(&self.writer);
        let cancel = self.cancel.child_token();
        drop(tokio::spawn(async move {
            let request = UiRequest {
                id: RequestId::from(id.as_str()),
                kind,
                method,
                payload: value,
            };
            let response = ui.request(request, timeout, Some(cancel)).await;
            let reply = ui_reply(reply_type, &id, response);
            if let Err(e) = write_line(&writer, &reply).await {
                debug!(request_id = %id, error = %e, "UI answer not delivered to agent");
            }
        }));
    }
}

fn ui_reply(reply_type: &str, id: &str, response: UiResponse) -> Value {
    let mut reply = match response {
        UiResponse::Value(Value::Object(map)) => map,
        UiResponse::Value(other) => {
            let mut map = Map::new();
            let _ = map.insert("value".into(), other);
            map
        }
        UiResponse::Cancelled => {
            let mut map = Map::new();
            let _ = map.insert("cancelled".into(), Value::Bool(true));
            map
        }
    };
    let _ = reply.insert("type".into(), Value::String(reply_type.to_owned()));
    let _ = reply.insert("id".into(), Value::String(id.to_owned()));
    Value::Object(reply)
}

/// Map an agent event line (snake_case type and keys) onto [`RuntimeEvent`].
/// Unknown shapes pass through as [`RuntimeEvent::Custom`].
fn normalize_event(value: Value) -> RuntimeEvent {
    let map = match value {
        Value::Object(map) => map,
        other => {
            return RuntimeEvent::Custom {
                name: "unknown".into(),
                data: other,
            };
        }
    };
    let raw_type = map
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    let name = match raw_type.as_str() {
        "tool_execution_start" => "toolStart".to_owned(),
        "tool_execution_update" => "toolUpdate".to_owned(),
        "tool_execution_end" => "toolEnd".to_owned(),
        other => camel_case(other),
    };

    let mut fields: Map<String, Value> = map
        .into_iter()
        .filter(|(key, _)| key != "type")
        .map(|(key, value)| (camel_case(&key), value))
        .collect();
    let data = Value::Object(fields.clone());
    let _ = fields.insert("type".into(), Value::String(name.clone()));

    match serde_json::from_value::<RuntimeEvent>(Value::Object(fields)) {
        Ok(RuntimeEvent::Custom { .. }) | Err(_) => RuntimeEvent::Custom { name, data },
        Ok(event) => event,
    }
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
