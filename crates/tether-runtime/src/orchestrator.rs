//! Per-workspace session orchestrator.
//!
//! Owns the workspace's slots and proxies every client operation to the
//! right one. A slot's `initialize` is spawned and its shared future stored
//! before any caller awaits it, so concurrent `create_slot` calls for the
//! same id share one initialization. Slot-scoped operations always await
//! readiness first.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tether_core::{EventSink, RequestId, SlotId, WorkspaceEvent, WorkspaceId, event_types};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, RuntimeError};
use crate::runtime::{QueueState, RuntimeContext, RuntimeFactory, SessionState, SessionSummary};
use crate::slot::{PumpContext, SessionSlot, SlotInfo, SlotState, spawn_pump};
use crate::ui::{PendingUiRequests, RequestRouter, UiBridge, UiRequestRecord, UiResponse};

const RUN_ENDED_CAPACITY: usize = 64;

/// State and transcript of a slot, returned when it is created or opened.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    /// Slot id.
    pub slot_id: SlotId,
    /// Runtime state.
    pub state: SessionState,
    /// Transcript.
    pub messages: Vec<Value>,
}

/// Owns the slots of one workspace.
pub struct SessionOrchestrator {
    workspace_id: WorkspaceId,
    cwd: PathBuf,
    factory: Arc<dyn RuntimeFactory>,
    sink: Arc<dyn EventSink>,
    router: Arc<RequestRouter>,
    pending: Arc<PendingUiRequests>,
    slots: Mutex<BTreeMap<SlotId, Arc<SessionSlot>>>,
    run_ended: broadcast::Sender<SlotId>,
    ui_timeout: Option<Duration>,
    disposed: AtomicBool,
}

impl SessionOrchestrator {
    /// Orchestrator for `workspace_id` rooted at `cwd`. Events go to `sink`.
    pub fn new(
        workspace_id: WorkspaceId,
        cwd: PathBuf,
        factory: Arc<dyn RuntimeFactory>,
        sink: Arc<dyn EventSink>,
        router: Arc<RequestRouter>,
        ui_timeout: Option<Duration>,
    ) -> Self {
        let (run_ended, _) = broadcast::channel(RUN_ENDED_CAPACITY);
        Self {
            workspace_id,
            cwd,
            factory,
            sink,
            router,
            pending: Arc::new(PendingUiRequests::default()),
            slots: Mutex::new(BTreeMap::new()),
            run_ended,
            ui_timeout,
            disposed: AtomicBool::new(false),
        }
    }

    /// Owning workspace.
    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// Working directory handed to runtimes.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Slot ids whose agent run just ended.
    pub fn subscribe_run_ended(&self) -> broadcast::Receiver<SlotId> {
        self.run_ended.subscribe()
    }

    fn emit(&self, event_type: &str, slot: Option<&SlotId>, data: Value) {
        self.sink.deliver(WorkspaceEvent::new(
            event_type,
            self.workspace_id.clone(),
            slot.cloned(),
            data,
        ));
    }

    // ── Slot lifecycle ──────────────────────────────────────────────────

    /// Create `id` (default slot when `None`), or join its initialization
    /// if it already exists, and return its state.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn create_slot(&self, id: Option<SlotId>) -> Result<SlotSnapshot> {
        let id = id.unwrap_or_default();
        let (slot, created) = self.get_or_start(&id)?;
        self.await_ready(&slot).await?;
        let snapshot = self.snapshot(&slot).await?;
        if created {
            info!(slot_id = %id, "slot ready");
            self.emit(event_types::SLOT_CREATED, Some(&id), json!({ "slotId": id }));
        }
        Ok(snapshot)
    }

    fn get_or_start(&self, id: &SlotId) -> Result<(Arc<SessionSlot>, bool)> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RuntimeError::InvalidOperation(format!(
                "workspace {} is closed",
                self.workspace_id
            )));
        }

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(id) {
            return Ok((Arc::clone(slot), false));
        }

        let ui = UiBridge::new(
            self.workspace_id.clone(),
            id.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.router),
            Arc::clone(&self.sink),
            self.ui_timeout,
        );
        let runtime = self.factory.create(RuntimeContext {
            cwd: self.cwd.clone(),
            workspace_id: self.workspace_id.clone(),
            slot_id: id.clone(),
            ui,
        })?;
        let slot = Arc::new(SessionSlot::new(id.clone(), runtime));
        spawn_pump(
            &slot,
            PumpContext {
                workspace_id: self.workspace_id.clone(),
                sink: Arc::clone(&self.sink),
                run_ended: self.run_ended.clone(),
            },
        );
        slot.begin_initialize();
        let _ = slots.insert(id.clone(), Arc::clone(&slot));
        debug!(slot_id = %id, "slot initializing");
        Ok((slot, true))
    }

    async fn await_ready(&self, slot: &Arc<SessionSlot>) -> Result<()> {
        let init = match slot.state() {
            SlotState::Ready => return Ok(()),
            SlotState::Failed(e) => return Err(e),
            SlotState::Initializing(init) => init,
        };
        let outcome = init.await;
        if slot.settle(&outcome) {
            if let Err(e) = &outcome {
                self.roll_back(slot, e).await;
            }
        }
        outcome
    }

    /// Undo a failed slot: stop its pump, unregister it, release the runtime.
    async fn roll_back(&self, slot: &Arc<SessionSlot>, error: &RuntimeError) {
        warn!(slot_id = %slot.id, error = %error, "slot initialization failed, rolling back");
        slot.stop_pump();
        {
            let mut slots = self.slots.lock();
            if slots.get(&slot.id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                let _ = slots.remove(&slot.id);
            }
        }
        let _ = self.pending.cancel_slot(&slot.id);
        slot.runtime.dispose().await;
    }

    async fn snapshot(&self, slot: &SessionSlot) -> Result<SlotSnapshot> {
        let state = slot.runtime.state().await?;
        slot.set_session_file(state.session_file.clone());
        let messages = slot.runtime.messages().await?;
        Ok(SlotSnapshot {
            slot_id: slot.id.clone(),
            state,
            messages,
        })
    }

    fn slot(&self, id: &SlotId) -> Result<Arc<SessionSlot>> {
        self.slots
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::SlotNotFound(id.to_string()))
    }

    async fn ready_slot(&self, id: &SlotId) -> Result<Arc<SessionSlot>> {
        let slot = self.slot(id)?;
        self.await_ready(&slot).await?;
        Ok(slot)
    }

    /// Close one slot: cancel its UI requests, stop its pump, dispose it.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn close_slot(&self, id: &SlotId) -> Result<()> {
        let slot = self
            .slots
            .lock()
            .remove(id)
            .ok_or_else(|| RuntimeError::SlotNotFound(id.to_string()))?;
        slot.stop_pump();
        let cancelled = self.pending.cancel_slot(id);
        if !slot.is_failed() {
            slot.runtime.dispose().await;
        }
        info!(slot_id = %id, cancelled, "slot closed");
        self.emit(event_types::SLOT_CLOSED, Some(id), json!({ "slotId": id }));
        Ok(())
    }

    /// Every slot, ordered by id.
    pub fn list_slots(&self) -> Vec<SlotInfo> {
        self.slots.lock().values().map(|s| s.info()).collect()
    }

    /// Whether a slot with this id exists.
    pub fn has_slot(&self, id: &SlotId) -> bool {
        self.slots.lock().contains_key(id)
    }

    /// Whether any slot has a run in progress.
    pub fn is_streaming(&self) -> bool {
        self.slots.lock().values().any(|s| s.is_streaming())
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    // ── Slot-scoped operations ──────────────────────────────────────────

    /// Start a run.
    #[instrument(skip(self, text, images), fields(workspace_id = %self.workspace_id))]
    pub async fn prompt(&self, slot: &SlotId, text: &str, images: Vec<Value>) -> Result<()> {
        self.ready_slot(slot).await?.runtime.prompt(text, images).await
    }

    /// Queue steering text and announce the new queue.
    #[instrument(skip(self, text), fields(workspace_id = %self.workspace_id))]
    pub async fn steer(&self, slot: &SlotId, text: &str) -> Result<QueueState> {
        let slot = self.ready_slot(slot).await?;
        slot.runtime.steer(text).await?;
        slot.publish_queue(&self.workspace_id, self.sink.as_ref()).await
    }

    /// Queue follow-up text and announce the new queue.
    #[instrument(skip(self, text), fields(workspace_id = %self.workspace_id))]
    pub async fn follow_up(&self, slot: &SlotId, text: &str) -> Result<QueueState> {
        let slot = self.ready_slot(slot).await?;
        slot.runtime.follow_up(text).await?;
        slot.publish_queue(&self.workspace_id, self.sink.as_ref()).await
    }

    /// Stop the current run.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn abort(&self, slot: &SlotId) -> Result<()> {
        self.ready_slot(slot).await?.runtime.abort().await
    }

    /// Switch model.
    pub async fn set_model(&self, slot: &SlotId, provider: &str, model_id: &str) -> Result<Value> {
        self.ready_slot(slot)
            .await?
            .runtime
            .set_model(provider, model_id)
            .await
    }

    /// Set the thinking level.
    pub async fn set_thinking_level(&self, slot: &SlotId, level: &str) -> Result<()> {
        self.ready_slot(slot)
            .await?
            .runtime
            .set_thinking_level(level)
            .await
    }

    /// Advance to the next model.
    pub async fn cycle_model(&self, slot: &SlotId) -> Result<Value> {
        self.ready_slot(slot).await?.runtime.cycle_model().await
    }

    /// Start a fresh session file.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn new_session(&self, slot: &SlotId) -> Result<Value> {
        let slot = self.ready_slot(slot).await?;
        let result = slot.runtime.new_session().await?;
        self.refresh_session_file(&slot).await;
        Ok(result)
    }

    /// Load another session file.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn switch_session(&self, slot: &SlotId, path: &str) -> Result<Value> {
        let slot = self.ready_slot(slot).await?;
        let result = slot.runtime.switch_session(path).await?;
        self.refresh_session_file(&slot).await;
        Ok(result)
    }

    /// Summarize older context.
    pub async fn compact(&self, slot: &SlotId, instructions: Option<&str>) -> Result<Value> {
        self.ready_slot(slot).await?.runtime.compact(instructions).await
    }

    /// Branch the conversation.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn fork(&self, slot: &SlotId, entry_id: &str) -> Result<Value> {
        let slot = self.ready_slot(slot).await?;
        let result = slot.runtime.fork(entry_id).await?;
        self.refresh_session_file(&slot).await;
        Ok(result)
    }

    /// Runtime state of a slot.
    pub async fn get_state(&self, slot: &SlotId) -> Result<SessionState> {
        let slot = self.ready_slot(slot).await?;
        let state = slot.runtime.state().await?;
        slot.set_session_file(state.session_file.clone());
        Ok(state)
    }

    /// Transcript of a slot.
    pub async fn get_messages(&self, slot: &SlotId) -> Result<Vec<Value>> {
        self.ready_slot(slot).await?.runtime.messages().await
    }

    /// Last announced queue of a slot.
    pub async fn queued_messages(&self, slot: &SlotId) -> Result<QueueState> {
        Ok(self.ready_slot(slot).await?.queue())
    }

    /// State and transcript of a slot.
    pub async fn slot_snapshot(&self, slot: &SlotId) -> Result<SlotSnapshot> {
        let slot = self.ready_slot(slot).await?;
        self.snapshot(&slot).await
    }

    async fn refresh_session_file(&self, slot: &SessionSlot) {
        match slot.runtime.state().await {
            Ok(state) => slot.set_session_file(state.session_file),
            Err(e) => debug!(slot_id = %slot.id, error = %e, "state refresh failed"),
        }
    }

    /// Saved sessions, via the default slot (or any ready slot).
    ///
    /// Empty sessions are dropped unless a live slot has that file loaded.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let slot = {
            let slots = self.slots.lock();
            slots
                .get(&SlotId::default())
                .or_else(|| {
                    slots
                        .values()
                        .find(|s| matches!(s.state(), SlotState::Ready))
                })
                .cloned()
        }
        .ok_or_else(|| RuntimeError::SlotNotFound(SlotId::default().to_string()))?;
        self.await_ready(&slot).await?;

        let sessions = slot.runtime.list_sessions().await?;
        let loaded: HashSet<String> = self
            .slots
            .lock()
            .values()
            .filter(|s| !s.is_failed())
            .filter_map(|s| s.session_file())
            .collect();
        Ok(sessions
            .into_iter()
            .filter(|s| s.message_count > 0 || loaded.contains(&s.path))
            .collect())
    }

    // ── UI requests ─────────────────────────────────────────────────────

    /// Deliver a client answer. Returns `false` for unknown or already
    /// settled requests, which are logged and otherwise ignored.
    pub fn respond_ui(&self, request_id: &RequestId, response: Value) -> bool {
        let honoured = self.pending.resolve(request_id, UiResponse::Value(response));
        let _ = self.router.remove(request_id);
        if !honoured {
            debug!(
                workspace_id = %self.workspace_id,
                request_id = %request_id,
                "stale UI response ignored"
            );
        }
        honoured
    }

    /// Whether `request_id` still awaits an answer.
    pub fn has_pending_request(&self, request_id: &RequestId) -> bool {
        self.pending.contains(request_id)
    }

    /// Unsettled UI requests, for replay to reattaching clients.
    pub fn pending_ui_requests(&self) -> Vec<UiRequestRecord> {
        self.pending.records()
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Cancel every request and release every slot. Safe to call twice.
    #[instrument(skip(self), fields(workspace_id = %self.workspace_id))]
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.pending.cancel_all();
        let slots: Vec<Arc<SessionSlot>> = std::mem::take(&mut *self.slots.lock())
            .into_values()
            .collect();
        for slot in &slots {
            slot.stop_pump();
        }
        let count = slots.len();
        for slot in slots {
            if !slot.is_failed() {
                slot.runtime.dispose().await;
            }
        }
        info!(slots = count, cancelled, "orchestrator disposed");
    }

    /// Whether [`SessionOrchestrator::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockFactory, wait_until};
    use crate::ui::{UiRequest, UiRequestKind};
    use assert_matches::assert_matches;
    use tether_core::RuntimeEvent;
    use tether_core::events::RecordingSink;

    struct Fixture {
        factory: Arc<MockFactory>,
        sink: Arc<RecordingSink>,
        router: Arc<RequestRouter>,
        orch: Arc<SessionOrchestrator>,
    }

    fn fixture_with(factory: MockFactory) -> Fixture {
        let factory = Arc::new(factory);
        let sink = Arc::new(RecordingSink::default());
        let router = Arc::new(RequestRouter::default());
        let orch = Arc::new(SessionOrchestrator::new(
            WorkspaceId::from("ws"),
            PathBuf::from("/repo"),
            factory.clone(),
            sink.clone(),
            Arc::clone(&router),
            None,
        ));
        Fixture {
            factory,
            sink,
            router,
            orch,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockFactory::new())
    }

    fn user_message(text: &str) -> RuntimeEvent {
        RuntimeEvent::MessageStart {
            message: json!({"role": "user", "content": text}),
        }
    }

    #[tokio::test]
    async fn concurrent_create_initializes_once() {
        let f = fixture_with(MockFactory::new().with_init_delay(Duration::from_millis(50)));
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let orch = Arc::clone(&f.orch);
            tasks.push(tokio::spawn(async move {
                orch.create_slot(Some(SlotId::from("x"))).await
            }));
        }
        let mut snapshots = Vec::new();
        for task in tasks {
            snapshots.push(task.await.unwrap().unwrap());
        }
        assert_eq!(f.factory.init_count(), 1);
        assert_eq!(f.factory.created_count(), 1);
        assert!(snapshots.iter().all(|s| *s == snapshots[0]));
        assert_eq!(f.sink.of_type(event_types::SLOT_CREATED).len(), 1);
    }

    #[tokio::test]
    async fn failed_initialization_rolls_back() {
        let f = fixture_with(MockFactory::new().failing("bad"));
        let err = f.orch.create_slot(Some(SlotId::from("bad"))).await.unwrap_err();
        assert_matches!(err, RuntimeError::Initialization(_));
        assert!(!f.orch.has_slot(&SlotId::from("bad")));
        assert!(f.factory.runtime(&SlotId::from("bad")).unwrap().is_disposed());

        let again = f.orch.create_slot(Some(SlotId::from("bad"))).await;
        assert!(again.is_err());
        assert_eq!(f.factory.init_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_failure() {
        let f = fixture_with(
            MockFactory::new()
                .failing("bad")
                .with_init_delay(Duration::from_millis(20)),
        );
        let a = f.orch.create_slot(Some(SlotId::from("bad")));
        let b = f.orch.create_slot(Some(SlotId::from("bad")));
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_err() && b.is_err());
        assert_eq!(f.factory.init_count(), 1);
        assert_eq!(f.orch.slot_count(), 0);
    }

    #[tokio::test]
    async fn unknown_slot_is_not_found() {
        let f = fixture();
        let err = f.orch.prompt(&SlotId::from("nope"), "hi", Vec::new()).await.unwrap_err();
        assert_matches!(err, RuntimeError::SlotNotFound(id) if id == "nope");
    }

    #[tokio::test]
    async fn operations_wait_for_initialization() {
        let f = fixture_with(MockFactory::new().with_init_delay(Duration::from_millis(30)));
        let orch = Arc::clone(&f.orch);
        let create = tokio::spawn(async move { orch.create_slot(None).await });
        wait_until(|| f.orch.has_slot(&SlotId::default())).await;

        f.orch.prompt(&SlotId::default(), "hello", Vec::new()).await.unwrap();
        let runtime = f.factory.runtime(&SlotId::default()).unwrap();
        assert_eq!(runtime.prompts(), vec!["hello".to_string()]);
        assert_eq!(f.factory.init_count(), 1);
        let _ = create.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn events_are_tagged_in_order() {
        let f = fixture();
        let _ = f.orch.create_slot(Some(SlotId::from("a"))).await.unwrap();
        let runtime = f.factory.runtime(&SlotId::from("a")).unwrap();
        for i in 0..20 {
            runtime.emit(RuntimeEvent::MessageUpdate {
                message: json!({"role": "assistant", "n": i}),
                delta: None,
            });
        }
        wait_until(|| f.sink.of_type("messageUpdate").len() == 20).await;
        let updates = f.sink.of_type("messageUpdate");
        for (i, event) in updates.iter().enumerate() {
            assert_eq!(event.data["message"]["n"], i);
            assert_eq!(event.session_slot_id, Some(SlotId::from("a")));
            assert_eq!(event.workspace_id.as_str(), "ws");
        }
    }

    #[tokio::test]
    async fn user_message_start_republishes_queue() {
        let f = fixture();
        let _ = f.orch.create_slot(None).await.unwrap();
        let slot = SlotId::default();
        let queue = f.orch.steer(&slot, "first").await.unwrap();
        assert_eq!(queue.steering, vec!["first".to_string()]);
        let _ = f.orch.steer(&slot, "second").await.unwrap();
        assert_eq!(f.sink.of_type(event_types::QUEUED_MESSAGES).len(), 2);

        // Runtime consumes the first steering entry to start a message.
        let runtime = f.factory.runtime(&slot).unwrap();
        runtime.set_queue(QueueState {
            steering: vec!["second".into()],
            follow_up: Vec::new(),
        });
        runtime.emit(user_message("first"));

        wait_until(|| f.sink.of_type(event_types::QUEUED_MESSAGES).len() == 3).await;
        let events = f.sink.events();
        let start = events.iter().position(|e| e.event_type == "messageStart").unwrap();
        let queued = events
            .iter()
            .rposition(|e| e.event_type == event_types::QUEUED_MESSAGES)
            .unwrap();
        assert!(queued > start);
        assert_eq!(events[queued].data["steering"], json!(["second"]));
        assert_eq!(f.orch.queued_messages(&slot).await.unwrap().steering, vec!["second"]);
    }

    #[tokio::test]
    async fn agent_end_publishes_run_ended_and_clears_streaming() {
        let f = fixture();
        let _ = f.orch.create_slot(Some(SlotId::from("exec-1"))).await.unwrap();
        let mut ended = f.orch.subscribe_run_ended();
        let runtime = f.factory.runtime(&SlotId::from("exec-1")).unwrap();

        runtime.emit(RuntimeEvent::AgentStart);
        wait_until(|| f.orch.is_streaming()).await;
        runtime.emit(RuntimeEvent::AgentEnd { messages: Vec::new() });

        let slot = tokio::time::timeout(Duration::from_secs(2), ended.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot, SlotId::from("exec-1"));
        assert!(!f.orch.is_streaming());
    }

    #[tokio::test]
    async fn list_sessions_hides_empty_unless_loaded() {
        let f = fixture();
        let _ = f.orch.create_slot(None).await.unwrap();
        let runtime = f.factory.runtime(&SlotId::default()).unwrap();
        runtime.set_sessions(vec![
            SessionSummary {
                path: "/s/full.jsonl".into(),
                message_count: 4,
                ..SessionSummary::default()
            },
            SessionSummary {
                path: "/s/empty.jsonl".into(),
                ..SessionSummary::default()
            },
            SessionSummary {
                path: "/s/open.jsonl".into(),
                ..SessionSummary::default()
            },
        ]);
        let _ = f.orch.create_slot(Some(SlotId::from("pane"))).await.unwrap();
        let _ = f.orch.switch_session(&SlotId::from("pane"), "/s/open.jsonl").await.unwrap();

        let paths: Vec<String> = f
            .orch
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.path)
            .collect();
        assert_eq!(paths, vec!["/s/full.jsonl", "/s/open.jsonl"]);
    }

    #[tokio::test]
    async fn stale_ui_response_is_ignored() {
        let f = fixture();
        let _ = f.orch.create_slot(None).await.unwrap();
        assert!(!f.orch.respond_ui(&RequestId::from("toolu_1"), json!({"answers": []})));
        assert!(f.orch.pending_ui_requests().is_empty());
        assert!(f.router.is_empty());
    }

    #[tokio::test]
    async fn questionnaire_round_trip() {
        let f = fixture();
        let _ = f.orch.create_slot(None).await.unwrap();
        let runtime = f.factory.runtime(&SlotId::default()).unwrap();
        let ui = runtime.ui().clone();
        let ask = tokio::spawn(async move {
            ui.request(
                UiRequest {
                    id: RequestId::from("toolu_1"),
                    kind: UiRequestKind::Questionnaire,
                    method: "questionnaire".into(),
                    payload: json!({"questions": [{"id": "q1"}]}),
                },
                None,
                None,
            )
            .await
        });
        wait_until(|| f.orch.has_pending_request(&RequestId::from("toolu_1"))).await;
        assert_eq!(f.orch.pending_ui_requests().len(), 1);
        assert!(f.router.get(&RequestId::from("toolu_1")).is_some());

        assert!(f.orch.respond_ui(&RequestId::from("toolu_1"), json!({"q1": "yes"})));
        assert_eq!(ask.await.unwrap(), UiResponse::Value(json!({"q1": "yes"})));
        assert!(!f.orch.respond_ui(&RequestId::from("toolu_1"), json!({"q1": "again"})));
    }

    #[tokio::test]
    async fn close_slot_cancels_its_requests() {
        let f = fixture();
        let _ = f.orch.create_slot(Some(SlotId::from("p"))).await.unwrap();
        let runtime = f.factory.runtime(&SlotId::from("p")).unwrap();
        let ui = runtime.ui().clone();
        let ask = tokio::spawn(async move {
            ui.request(
                UiRequest {
                    id: RequestId::from("r1"),
                    kind: UiRequestKind::Extension,
                    method: "confirm".into(),
                    payload: json!({}),
                },
                None,
                None,
            )
            .await
        });
        wait_until(|| f.orch.has_pending_request(&RequestId::from("r1"))).await;

        f.orch.close_slot(&SlotId::from("p")).await.unwrap();
        assert_eq!(ask.await.unwrap(), UiResponse::Cancelled);
        assert!(runtime.is_disposed());
        assert_eq!(f.sink.of_type(event_types::SLOT_CLOSED).len(), 1);
        assert_matches!(
            f.orch.close_slot(&SlotId::from("p")).await,
            Err(RuntimeError::SlotNotFound(_))
        );
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let f = fixture_with(MockFactory::new().failing("bad"));
        let _ = f.orch.create_slot(None).await.unwrap();
        let _ = f.orch.create_slot(Some(SlotId::from("bad"))).await;
        f.orch.dispose().await;
        f.orch.dispose().await;
        assert!(f.orch.is_disposed());
        assert_eq!(f.orch.slot_count(), 0);
        assert!(f.factory.runtime(&SlotId::default()).unwrap().is_disposed());
        assert_matches!(
            f.orch.create_slot(None).await,
            Err(RuntimeError::InvalidOperation(_))
        );
    }

    #[tokio::test]
    async fn new_session_tracks_loaded_file() {
        let f = fixture();
        let _ = f.orch.create_slot(None).await.unwrap();
        let _ = f.orch.new_session(&SlotId::default()).await.unwrap();
        let slots = f.orch.list_slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].status, "ready");
        assert!(slots[0].session_file.is_some());
    }
}
