//! Open workspaces, attached-client counts, and event buffering.
//!
//! A workspace lives from its first `open_workspace` until an explicit
//! `close_workspace`; clients only attach and detach. While nobody is
//! attached, the workspace's [`Outbox`] buffers events (drop-oldest) and the
//! next attach receives them in the open response. The buffer-or-deliver
//! decision and the attach itself happen under the same lock, so a client
//! sees every event exactly once and in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tether_core::{EventSink, RequestId, SlotId, WorkspaceEvent, WorkspaceId};
use tether_docs::{DocWatcher, DocsService};
use tether_settings::{DocsSettings, TetherSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::automation::JobAutomation;
use crate::buffer::EventBuffer;
use crate::errors::{Result, RuntimeError};
use crate::orchestrator::{SessionOrchestrator, SlotSnapshot};
use crate::runtime::{RuntimeFactory, SessionState};
use crate::slot::SlotInfo;
use crate::ui::{RequestRouter, UiRequestRecord};

// ─────────────────────────────────────────────────────────────────────────────
// Outbox
// ─────────────────────────────────────────────────────────────────────────────

struct OutboxState {
    attached: usize,
    buffer: EventBuffer,
}

/// Per-workspace event sink: buffers while detached, delivers live otherwise.
pub struct Outbox {
    state: Mutex<OutboxState>,
    live: Arc<dyn EventSink>,
    observer: Option<Arc<dyn EventSink>>,
}

impl Outbox {
    fn new(
        capacity: usize,
        live: Arc<dyn EventSink>,
        observer: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            state: Mutex::new(OutboxState {
                attached: 0,
                buffer: EventBuffer::new(capacity),
            }),
            live,
            observer,
        }
    }

    /// Count one more client, run `hook`, and hand back the buffered events.
    fn attach(&self, hook: impl FnOnce()) -> (usize, Vec<WorkspaceEvent>) {
        let mut state = self.state.lock();
        state.attached += 1;
        hook();
        (state.attached, state.buffer.drain())
    }

    fn detach(&self) -> usize {
        let mut state = self.state.lock();
        state.attached = state.attached.saturating_sub(1);
        state.attached
    }

    /// Attached client count.
    pub fn attached(&self) -> usize {
        self.state.lock().attached
    }

    /// Buffered event count.
    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Events evicted from the buffer so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().buffer.dropped()
    }
}

impl EventSink for Outbox {
    fn deliver(&self, event: WorkspaceEvent) {
        let mut state = self.state.lock();
        if let Some(observer) = &self.observer {
            observer.deliver(event.clone());
        }
        if state.attached == 0 {
            if state.buffer.push(event) && state.buffer.dropped() % 100 == 1 {
                debug!(dropped = state.buffer.dropped(), "event buffer full, dropping oldest");
            }
        } else {
            self.live.deliver(event);
        }
    }
}

/// Sees every event of every workspace, buffered or live.
pub trait WorkspaceObserver: Send + Sync {
    /// Sink for the workspace `id`, rooted at `root`.
    fn sink_for(&self, id: &WorkspaceId, root: &Path) -> Arc<dyn EventSink>;
}

impl<T: EventSink + 'static> WorkspaceObserver for Arc<T> {
    fn sink_for(&self, _id: &WorkspaceId, _root: &Path) -> Arc<dyn EventSink> {
        Arc::clone(self) as Arc<dyn EventSink>
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workspace
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace summary for listings.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// Workspace id.
    pub id: WorkspaceId,
    /// Canonical root path.
    pub path: PathBuf,
    /// Attached client count.
    pub attached_clients: usize,
    /// Slots.
    pub slots: Vec<SlotInfo>,
    /// At least one slot is streaming.
    pub is_active: bool,
    /// Events waiting for the next attach.
    pub buffered_events: usize,
    /// Creation time (RFC 3339).
    pub created_at: String,
}

/// One open working directory.
pub struct Workspace {
    id: WorkspaceId,
    root: PathBuf,
    created_at: String,
    outbox: Arc<Outbox>,
    orchestrator: Arc<SessionOrchestrator>,
    docs: Arc<DocsService>,
    automation: Arc<JobAutomation>,
    watcher: Mutex<Option<DocWatcher>>,
    background: CancellationToken,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Workspace id.
    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    /// Canonical root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slot orchestrator.
    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    /// Plans and jobs.
    pub fn docs(&self) -> &Arc<DocsService> {
        &self.docs
    }

    /// Job phase automation.
    pub fn automation(&self) -> &Arc<JobAutomation> {
        &self.automation
    }

    /// Event sink of this workspace.
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Listing summary.
    pub fn info(&self) -> WorkspaceInfo {
        WorkspaceInfo {
            id: self.id.clone(),
            path: self.root.clone(),
            attached_clients: self.outbox.attached(),
            slots: self.orchestrator.list_slots(),
            is_active: self.orchestrator.is_streaming(),
            buffered_events: self.outbox.buffered_len(),
            created_at: self.created_at.clone(),
        }
    }

    /// Create the default slot and start document reconciliation.
    async fn start(&self, docs_settings: &DocsSettings) -> Result<SlotSnapshot> {
        let snapshot = self.orchestrator.create_slot(None).await?;
        self.docs.restore_active_plan().await;
        Arc::clone(&self.automation).spawn(self.background.child_token());
        match DocWatcher::start(Arc::clone(&self.docs), docs_settings).await {
            Ok(watcher) => *self.watcher.lock() = Some(watcher),
            Err(e) => warn!(workspace_id = %self.id, error = %e, "document watcher unavailable"),
        }
        Ok(snapshot)
    }

    async fn shutdown(&self) {
        self.background.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        self.orchestrator.dispose().await;
    }
}

/// Result of opening (or reopening) a workspace.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenWorkspace {
    /// Workspace summary after attaching.
    pub workspace: WorkspaceInfo,
    /// Default slot state.
    pub state: SessionState,
    /// Default slot transcript.
    pub messages: Vec<Value>,
    /// Events emitted while nobody was attached, oldest first.
    pub buffered_events: Vec<WorkspaceEvent>,
    /// Unsettled UI requests to show again.
    pub pending_requests: Vec<UiRequestRecord>,
    /// The workspace was already open.
    pub is_existing: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace manager settings.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Document directories and reconciliation timing.
    pub docs: DocsSettings,
    /// Buffered events per detached workspace.
    pub event_buffer_capacity: usize,
    /// Default timeout for UI requests (`None` waits forever).
    pub ui_request_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            docs: DocsSettings::default(),
            event_buffer_capacity: crate::buffer::DEFAULT_CAPACITY,
            ui_request_timeout: None,
        }
    }
}

impl ManagerConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let timeout = settings.workspace.ui_request_timeout_secs;
        Self {
            docs: settings.docs.clone(),
            event_buffer_capacity: settings.workspace.event_buffer_capacity,
            ui_request_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }
}

/// Registry of open workspaces, owned by the process root.
pub struct WorkspaceManager {
    config: ManagerConfig,
    factory: Arc<dyn RuntimeFactory>,
    live: Arc<dyn EventSink>,
    observer: Option<Arc<dyn WorkspaceObserver>>,
    router: Arc<RequestRouter>,
    workspaces: DashMap<WorkspaceId, Arc<Workspace>>,
    paths: DashMap<PathBuf, WorkspaceId>,
    open_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl WorkspaceManager {
    /// Manager building runtimes with `factory` and delivering attached
    /// workspaces' events to `live`.
    pub fn new(
        config: ManagerConfig,
        factory: Arc<dyn RuntimeFactory>,
        live: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            factory,
            live,
            observer: None,
            router: Arc::new(RequestRouter::default()),
            workspaces: DashMap::new(),
            paths: DashMap::new(),
            open_locks: DashMap::new(),
        }
    }

    /// Also show every event, buffered or live, to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: impl WorkspaceObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Process-wide UI request routes.
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Open `path`, creating the workspace on first use, and attach the
    /// caller. `attach` runs under the workspace's outbox lock: events
    /// emitted before it are in `buffered_events`, events after it are live.
    #[instrument(skip(self, attach), fields(path = %path.display()))]
    pub async fn open_workspace<F>(&self, path: &Path, attach: F) -> Result<OpenWorkspace>
    where
        F: FnOnce(&WorkspaceId) + Send,
    {
        let root = tokio::fs::canonicalize(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::WorkspaceNotFound(path.display().to_string())
            } else {
                RuntimeError::Io(format!("{}: {e}", path.display()))
            }
        })?;
        if !tokio::fs::metadata(&root).await.is_ok_and(|m| m.is_dir()) {
            return Err(RuntimeError::InvalidOperation(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let lock = Arc::clone(
            self.open_locks
                .entry(root.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        let guard = lock.lock().await;
        let result = self.open_locked(root.clone(), attach).await;
        drop(guard);
        drop(lock);
        let _ = self
            .open_locks
            .remove_if(&root, |_, m| Arc::strong_count(m) == 1);
        result
    }

    /// Attach to the workspace at `root` or start one. Caller holds the
    /// path's open lock.
    async fn open_locked<F>(&self, root: PathBuf, attach: F) -> Result<OpenWorkspace>
    where
        F: FnOnce(&WorkspaceId) + Send,
    {
        if let Some(workspace) = self.by_path(&root) {
            // Fetch first: a failure leaves the buffer and count untouched.
            let snapshot = workspace.orchestrator.create_slot(None).await?;
            let (attached, buffered) = workspace.outbox.attach(|| attach(&workspace.id));
            info!(
                workspace_id = %workspace.id,
                attached,
                buffered = buffered.len(),
                "attached to existing workspace"
            );
            return Ok(Self::opened(&workspace, snapshot, buffered, true));
        }

        let workspace = Arc::new(self.build(root.clone()));
        let _ = self.workspaces.insert(workspace.id.clone(), Arc::clone(&workspace));
        let _ = self.paths.insert(root.clone(), workspace.id.clone());

        let snapshot = match workspace.start(&self.config.docs).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(workspace_id = %workspace.id, error = %e, "workspace failed to start");
                self.unregister(&workspace);
                workspace.shutdown().await;
                return Err(e);
            }
        };
        let (_, buffered) = workspace.outbox.attach(|| attach(&workspace.id));
        info!(workspace_id = %workspace.id, root = %root.display(), "workspace opened");
        Ok(Self::opened(&workspace, snapshot, buffered, false))
    }

    fn build(&self, root: PathBuf) -> Workspace {
        let id = WorkspaceId::new();
        let outbox = Arc::new(Outbox::new(
            self.config.event_buffer_capacity,
            Arc::clone(&self.live),
            self.observer.as_ref().map(|o| o.sink_for(&id, &root)),
        ));
        let sink: Arc<dyn EventSink> = outbox.clone();
        let orchestrator = Arc::new(SessionOrchestrator::new(
            id.clone(),
            root.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&sink),
            Arc::clone(&self.router),
            self.config.ui_request_timeout,
        ));
        let docs = Arc::new(DocsService::new(id.clone(), &root, &self.config.docs, sink));
        let automation = Arc::new(JobAutomation::new(
            Arc::clone(&docs),
            Arc::clone(&orchestrator),
        ));
        Workspace {
            id,
            root,
            created_at: chrono::Utc::now().to_rfc3339(),
            outbox,
            orchestrator,
            docs,
            automation,
            watcher: Mutex::new(None),
            background: CancellationToken::new(),
        }
    }

    fn opened(
        workspace: &Workspace,
        snapshot: SlotSnapshot,
        buffered_events: Vec<WorkspaceEvent>,
        is_existing: bool,
    ) -> OpenWorkspace {
        OpenWorkspace {
            workspace: workspace.info(),
            state: snapshot.state,
            messages: snapshot.messages,
            buffered_events,
            pending_requests: workspace.orchestrator.pending_ui_requests(),
            is_existing,
        }
    }

    fn by_path(&self, root: &Path) -> Option<Arc<Workspace>> {
        let id = self.paths.get(root).map(|r| r.value().clone())?;
        self.workspaces.get(&id).map(|w| Arc::clone(w.value()))
    }

    fn unregister(&self, workspace: &Workspace) {
        let _ = self.workspaces.remove(&workspace.id);
        let _ = self
            .paths
            .remove_if(&workspace.root, |_, id| *id == workspace.id);
    }

    /// Look up an open workspace.
    pub fn workspace(&self, id: &WorkspaceId) -> Result<Arc<Workspace>> {
        self.workspaces
            .get(id)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| RuntimeError::WorkspaceNotFound(id.to_string()))
    }

    /// A client left. Never closes the workspace. Returns the new count.
    #[instrument(skip(self))]
    pub fn detach(&self, id: &WorkspaceId) -> Result<usize> {
        let workspace = self.workspace(id)?;
        let attached = workspace.outbox.detach();
        debug!(attached, "client detached");
        Ok(attached)
    }

    /// Tear a workspace down. Callers notify attached clients first.
    #[instrument(skip(self))]
    pub async fn close_workspace(&self, id: &WorkspaceId) -> Result<()> {
        let workspace = self.workspace(id)?;
        self.unregister(&workspace);
        workspace.shutdown().await;
        info!(root = %workspace.root.display(), "workspace closed");
        Ok(())
    }

    /// Every open workspace, ordered by path.
    pub fn list_workspaces(&self) -> Vec<WorkspaceInfo> {
        let mut list: Vec<WorkspaceInfo> = self.workspaces.iter().map(|w| w.info()).collect();
        list.sort_by(|a, b| a.path.cmp(&b.path));
        list
    }

    /// Workspaces with at least one streaming slot.
    pub fn active_workspaces(&self) -> Vec<WorkspaceInfo> {
        self.list_workspaces()
            .into_iter()
            .filter(|w| w.is_active)
            .collect()
    }

    /// Number of open workspaces.
    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }

    /// Route a UI answer: by the routing table first, then by the ids the
    /// client declared. Unknown targets are stale and ignored.
    pub fn respond_ui(
        &self,
        request_id: &RequestId,
        declared_workspace: Option<&WorkspaceId>,
        declared_slot: Option<&SlotId>,
        response: Value,
    ) -> bool {
        let target = self
            .router
            .get(request_id)
            .map(|route| route.workspace_id)
            .or_else(|| declared_workspace.cloned());
        let workspace = target.and_then(|id| self.workspace(&id).ok());
        match workspace {
            Some(workspace) => workspace.orchestrator.respond_ui(request_id, response),
            None => {
                let _ = self.router.remove(request_id);
                debug!(
                    request_id = %request_id,
                    declared_slot = ?declared_slot,
                    "UI response for unknown workspace ignored"
                );
                false
            }
        }
    }

    /// Close every workspace.
    pub async fn shutdown(&self) {
        let ids: Vec<WorkspaceId> = self.workspaces.iter().map(|w| w.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.close_workspace(&id).await {
                debug!(workspace_id = %id, error = %e, "workspace already closed");
            }
        }
    }
}
