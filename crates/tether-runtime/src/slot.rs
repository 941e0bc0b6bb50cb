//! One conversation pane: a runtime, its readiness state, and its event pump.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tether_core::{EventSink, RuntimeEvent, SlotId, WorkspaceEvent, WorkspaceId, event_types};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Result, RuntimeError};
use crate::runtime::{QueueState, SessionRuntime};

/// Initialization shared by every caller waiting on a slot.
pub(crate) type InitFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Readiness of a slot.
#[derive(Clone)]
pub(crate) enum SlotState {
    /// `initialize` is running; await the stored future.
    Initializing(InitFuture),
    /// Usable.
    Ready,
    /// Initialization failed; the slot is being removed.
    Failed(RuntimeError),
}

impl SlotState {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Initializing(_) => "initializing",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

/// Slot summary for listings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotInfo {
    /// Slot id.
    pub slot_id: SlotId,
    /// `initializing`, `ready`, or `failed`.
    pub status: String,
    /// A run is in progress.
    pub is_streaming: bool,
    /// Session file the slot last loaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_file: Option<String>,
}

pub(crate) struct SessionSlot {
    pub(crate) id: SlotId,
    pub(crate) runtime: Arc<dyn SessionRuntime>,
    state: Mutex<SlotState>,
    streaming: AtomicBool,
    session_file: Mutex<Option<String>>,
    queue: Mutex<QueueState>,
    pump: CancellationToken,
}

impl SessionSlot {
    /// Unstarted slot. Callers subscribe the pump and then call
    /// [`SessionSlot::begin_initialize`] before publishing the slot.
    pub(crate) fn new(id: SlotId, runtime: Arc<dyn SessionRuntime>) -> Self {
        Self {
            id,
            runtime,
            state: Mutex::new(SlotState::Ready),
            streaming: AtomicBool::new(false),
            session_file: Mutex::new(None),
            queue: Mutex::new(QueueState::default()),
            pump: CancellationToken::new(),
        }
    }

    /// Spawn `initialize` and store its shared future before anyone awaits.
    pub(crate) fn begin_initialize(&self) {
        let runtime = Arc::clone(&self.runtime);
        let task = tokio::spawn(async move { runtime.initialize().await });
        let init: BoxFuture<'static, Result<()>> = async move {
            match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e @ RuntimeError::Initialization(_))) => Err(e),
                Ok(Err(e)) => Err(RuntimeError::Initialization(e.to_string())),
                Err(e) => Err(RuntimeError::Initialization(format!(
                    "initialization task failed: {e}"
                ))),
            }
        }
        .boxed();
        *self.state.lock() = SlotState::Initializing(init.shared());
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state.lock().clone()
    }

    /// Record the outcome of initialization. Returns `true` for the one
    /// caller that moved the slot out of `Initializing`.
    pub(crate) fn settle(&self, outcome: &Result<()>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Initializing(_)) {
            return false;
        }
        *state = match outcome {
            Ok(()) => SlotState::Ready,
            Err(e) => SlotState::Failed(e.clone()),
        };
        true
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Failed(_))
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn session_file(&self) -> Option<String> {
        self.session_file.lock().clone()
    }

    pub(crate) fn set_session_file(&self, file: Option<String>) {
        *self.session_file.lock() = file;
    }

    pub(crate) fn queue(&self) -> QueueState {
        self.queue.lock().clone()
    }

    pub(crate) fn info(&self) -> SlotInfo {
        SlotInfo {
            slot_id: self.id.clone(),
            status: self.state.lock().label().to_owned(),
            is_streaming: self.is_streaming(),
            session_file: self.session_file(),
        }
    }

    pub(crate) fn stop_pump(&self) {
        self.pump.cancel();
    }

    /// Re-read the runtime queue and announce it.
    pub(crate) async fn publish_queue(
        &self,
        workspace_id: &WorkspaceId,
        sink: &dyn EventSink,
    ) -> Result<QueueState> {
        let queue = self.runtime.queued_messages().await?;
        *self.queue.lock() = queue.clone();
        sink.deliver(WorkspaceEvent::new(
            event_types::QUEUED_MESSAGES,
            workspace_id.clone(),
            Some(self.id.clone()),
            json!(queue),
        ));
        Ok(queue)
    }
}

/// Everything the pump needs besides the slot itself.
pub(crate) struct PumpContext {
    pub(crate) workspace_id: WorkspaceId,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) run_ended: broadcast::Sender<SlotId>,
}

/// Forward runtime events, tagged, in emission order.
///
/// Subscribes before returning so nothing emitted during initialization
/// is missed.
pub(crate) fn spawn_pump(slot: &Arc<SessionSlot>, ctx: PumpContext) {
    let mut rx = slot.runtime.subscribe();
    let slot = Arc::clone(slot);
    drop(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = slot.pump.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        counter!("slot_events_lagged_total").increment(skipped);
                        warn!(
                            workspace_id = %ctx.workspace_id,
                            slot_id = %slot.id,
                            skipped,
                            "slot event pump lagged"
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            forward(&slot, &ctx, event).await;
        }
        debug!(workspace_id = %ctx.workspace_id, slot_id = %slot.id, "slot event pump stopped");
    }));
}

async fn forward(slot: &SessionSlot, ctx: &PumpContext, event: RuntimeEvent) {
    match &event {
        RuntimeEvent::AgentStart => slot.streaming.store(true, Ordering::Release),
        RuntimeEvent::AgentEnd { .. } => slot.streaming.store(false, Ordering::Release),
        _ => {}
    }

    ctx.sink.deliver(WorkspaceEvent::from_runtime(
        ctx.workspace_id.clone(),
        slot.id.clone(),
        &event,
    ));

    // The runtime may have consumed a queued steering entry to start this
    // message; clients must see the queue as it is now.
    if event.is_user_message_start() {
        if let Err(e) = slot.publish_queue(&ctx.workspace_id, ctx.sink.as_ref()).await {
            debug!(slot_id = %slot.id, error = %e, "queue refresh failed");
        }
    }

    if matches!(event, RuntimeEvent::AgentEnd { .. }) {
        let _ = ctx.run_ended.send(slot.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeContext, RuntimeFactory};
    use crate::testutil::MockFactory;
    use crate::ui::{PendingUiRequests, RequestRouter, UiBridge};
    use std::time::Duration;
    use tether_core::NullSink;
    use tether_core::events::RecordingSink;

    fn slot(factory: &MockFactory) -> Arc<SessionSlot> {
        let workspace_id = WorkspaceId::from("w");
        let slot_id = SlotId::from("s1");
        let runtime = factory
            .create(RuntimeContext {
                cwd: std::env::temp_dir(),
                workspace_id: workspace_id.clone(),
                slot_id: slot_id.clone(),
                ui: UiBridge::new(
                    workspace_id,
                    slot_id.clone(),
                    Arc::new(PendingUiRequests::default()),
                    Arc::new(RequestRouter::default()),
                    Arc::new(NullSink),
                    None,
                ),
            })
            .unwrap();
        Arc::new(SessionSlot::new(slot_id, runtime))
    }

    #[tokio::test]
    async fn pump_tracks_streaming_and_announces_run_end() {
        let factory = MockFactory::new();
        let slot = slot(&factory);
        let sink = Arc::new(RecordingSink::default());
        let (run_ended, mut ended) = broadcast::channel(4);
        spawn_pump(
            &slot,
            PumpContext {
                workspace_id: WorkspaceId::from("w"),
                sink: sink.clone(),
                run_ended,
            },
        );
        let runtime = factory.runtime(&slot.id).unwrap();

        runtime.emit(RuntimeEvent::AgentStart);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(slot.is_streaming());

        runtime.emit(RuntimeEvent::AgentEnd { messages: Vec::new() });
        let id = tokio::time::timeout(Duration::from_secs(5), ended.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, slot.id);
        assert!(!slot.is_streaming());
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].session_slot_id.as_ref(), Some(&slot.id));
        slot.stop_pump();
    }

    #[tokio::test]
    async fn lagging_pump_keeps_forwarding() {
        let factory = MockFactory::new();
        let slot = slot(&factory);
        let sink = Arc::new(RecordingSink::default());
        let (run_ended, mut ended) = broadcast::channel(4);
        spawn_pump(
            &slot,
            PumpContext {
                workspace_id: WorkspaceId::from("w"),
                sink: sink.clone(),
                run_ended,
            },
        );
        let runtime = factory.runtime(&slot.id).unwrap();

        // The pump task cannot run until this test yields.
        for i in 0..1100 {
            runtime.emit(RuntimeEvent::Custom {
                name: "tick".into(),
                data: json!({"i": i}),
            });
        }
        runtime.emit(RuntimeEvent::AgentEnd { messages: Vec::new() });

        let _ = tokio::time::timeout(Duration::from_secs(5), ended.recv())
            .await
            .unwrap()
            .unwrap();
        let ticks = sink.of_type("tick");
        assert!(ticks.len() < 1100);
        assert_eq!(ticks.last().unwrap().data["i"], 1099);
        assert_eq!(sink.of_type("agentEnd").len(), 1);
        slot.stop_pump();
    }
}
