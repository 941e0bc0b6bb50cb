//! In-memory scripted runtime for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_core::{RuntimeEvent, SlotId};
use tokio::sync::broadcast;

use crate::errors::{Result, RuntimeError};
use crate::runtime::{
    ModelRef, QueueState, RuntimeContext, RuntimeFactory, SessionRuntime, SessionState,
    SessionSummary,
};
use crate::ui::UiBridge;

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Scripted runtime. Tests drive it with [`MockRuntime::emit`].
pub struct MockRuntime {
    slot_id: SlotId,
    ui: UiBridge,
    events: broadcast::Sender<RuntimeEvent>,
    init_delay: Duration,
    fail_init: bool,
    init_calls: Arc<AtomicUsize>,
    state: Mutex<SessionState>,
    messages: Mutex<Vec<Value>>,
    queue: Mutex<QueueState>,
    sessions: Mutex<Vec<SessionSummary>>,
    prompts: Mutex<Vec<String>>,
    disposed: AtomicBool,
}

impl MockRuntime {
    /// Send a runtime event to subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    /// Emit `agentStart` then `agentEnd`.
    pub fn finish_run(&self) {
        self.emit(RuntimeEvent::AgentStart);
        self.emit(RuntimeEvent::AgentEnd {
            messages: Vec::new(),
        });
    }

    /// Prompts received, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Replace the queue the runtime reports.
    pub fn set_queue(&self, queue: QueueState) {
        *self.queue.lock() = queue;
    }

    /// Replace the saved-session listing.
    pub fn set_sessions(&self, sessions: Vec<SessionSummary>) {
        *self.sessions.lock() = sessions;
    }

    /// Whether `dispose` ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The bridge handed to this runtime.
    pub fn ui(&self) -> &UiBridge {
        &self.ui
    }
}

#[async_trait]
impl SessionRuntime for MockRuntime {
    async fn initialize(&self) -> Result<()> {
        let _ = self.init_calls.fetch_add(1, Ordering::SeqCst);
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        if self.fail_init {
            return Err(RuntimeError::Initialization(format!(
                "scripted failure for {}",
                self.slot_id
            )));
        }
        Ok(())
    }

    async fn state(&self) -> Result<SessionState> {
        let mut state = self.state.lock().clone();
        state.message_count = self.messages.lock().len();
        Ok(state)
    }

    async fn messages(&self) -> Result<Vec<Value>> {
        Ok(self.messages.lock().clone())
    }

    async fn prompt(&self, text: &str, _images: Vec<Value>) -> Result<()> {
        self.prompts.lock().push(text.to_owned());
        self.messages
            .lock()
            .push(json!({"role": "user", "content": text}));
        Ok(())
    }

    async fn steer(&self, text: &str) -> Result<()> {
        self.queue.lock().steering.push(text.to_owned());
        Ok(())
    }

    async fn follow_up(&self, text: &str) -> Result<()> {
        self.queue.lock().follow_up.push(text.to_owned());
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        Ok(())
    }

    async fn set_model(&self, provider: &str, model_id: &str) -> Result<Value> {
        let model = ModelRef {
            provider: provider.to_owned(),
            id: model_id.to_owned(),
        };
        let value = json!(model);
        self.state.lock().model = Some(model);
        Ok(value)
    }

    async fn set_thinking_level(&self, level: &str) -> Result<()> {
        self.state.lock().thinking_level = Some(level.to_owned());
        Ok(())
    }

    async fn cycle_model(&self) -> Result<Value> {
        Ok(json!(self.state.lock().model))
    }

    async fn new_session(&self) -> Result<Value> {
        self.messages.lock().clear();
        let file = format!("/sessions/{}-{}.jsonl", self.slot_id, self.prompts.lock().len());
        self.state.lock().session_file = Some(file);
        Ok(json!({ "cancelled": false }))
    }

    async fn switch_session(&self, path: &str) -> Result<Value> {
        self.state.lock().session_file = Some(path.to_owned());
        Ok(json!({ "cancelled": false }))
    }

    async fn compact(&self, instructions: Option<&str>) -> Result<Value> {
        Ok(json!({ "summary": instructions.unwrap_or("compacted") }))
    }

    async fn fork(&self, entry_id: &str) -> Result<Value> {
        Ok(json!({ "entryId": entry_id }))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        Ok(self.sessions.lock().clone())
    }

    async fn queued_messages(&self) -> Result<QueueState> {
        Ok(self.queue.lock().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

/// Factory producing [`MockRuntime`]s and remembering them per slot.
#[derive(Default)]
pub struct MockFactory {
    runtimes: Mutex<HashMap<SlotId, Arc<MockRuntime>>>,
    failing: HashSet<SlotId>,
    init_delay: Duration,
    init_calls: Arc<AtomicUsize>,
    created: AtomicUsize,
}

impl MockFactory {
    /// Factory whose runtimes initialize instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `initialize` by `delay`.
    #[must_use]
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Make initialization of `slot` fail.
    #[must_use]
    pub fn failing(mut self, slot: &str) -> Self {
        let _ = self.failing.insert(SlotId::from(slot));
        self
    }

    /// Latest runtime built for `slot`.
    pub fn runtime(&self, slot: &SlotId) -> Option<Arc<MockRuntime>> {
        self.runtimes.lock().get(slot).cloned()
    }

    /// Total `initialize` calls.
    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Total runtimes built.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl RuntimeFactory for MockFactory {
    fn create(&self, ctx: RuntimeContext) -> Result<Arc<dyn SessionRuntime>> {
        let (events, _) = broadcast::channel(1024);
        let runtime = Arc::new(MockRuntime {
            slot_id: ctx.slot_id.clone(),
            fail_init: self.failing.contains(&ctx.slot_id),
            ui: ctx.ui,
            events,
            init_delay: self.init_delay,
            init_calls: Arc::clone(&self.init_calls),
            state: Mutex::new(SessionState::default()),
            messages: Mutex::new(Vec::new()),
            queue: Mutex::new(QueueState::default()),
            sessions: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        let _ = self.created.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .runtimes
            .lock()
            .insert(ctx.slot_id, Arc::clone(&runtime));
        Ok(runtime)
    }
}
