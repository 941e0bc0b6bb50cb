//! Extension UI and questionnaire requests.
//!
//! A runtime asks the user something through its [`UiBridge`]. The bridge
//! registers a oneshot resolver in the workspace's [`PendingUiRequests`],
//! records the origin in the process-wide [`RequestRouter`], and only then
//! emits the request event, so a response can never arrive before its
//! route exists. Every request settles exactly once: client response,
//! timeout, cancellation token, or disposal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tether_core::{EventSink, RequestId, SlotId, WorkspaceEvent, WorkspaceId, event_types};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Kind of user-facing request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UiRequestKind {
    /// Dialog raised by an agent extension (select, confirm, input, ...).
    Extension,
    /// Multi-question form raised by the questionnaire tool.
    Questionnaire,
}

impl UiRequestKind {
    /// Event type announcing a request of this kind.
    pub fn event_type(self) -> &'static str {
        match self {
            Self::Extension => event_types::EXTENSION_UI_REQUEST,
            Self::Questionnaire => event_types::QUESTIONNAIRE_REQUEST,
        }
    }
}

/// A request as raised by a runtime.
#[derive(Clone, Debug)]
pub struct UiRequest {
    /// Request id (extension request id or questionnaire tool-call id).
    pub id: RequestId,
    /// Request kind.
    pub kind: UiRequestKind,
    /// Dialog method, e.g. `select` or `confirm`.
    pub method: String,
    /// Method-specific payload.
    pub payload: Value,
}

/// Pending request, as replayed to reattaching clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiRequestRecord {
    /// Request id.
    pub request_id: RequestId,
    /// Request kind.
    pub kind: UiRequestKind,
    /// Slot that raised it.
    pub slot_id: SlotId,
    /// Dialog method.
    pub method: String,
    /// Method-specific payload.
    pub payload: Value,
    /// Creation time (RFC 3339).
    pub created_at: String,
}

/// How a request settled.
#[derive(Clone, Debug, PartialEq)]
pub enum UiResponse {
    /// A client answered.
    Value(Value),
    /// Timed out, cancelled, or the slot went away.
    Cancelled,
}

struct PendingEntry {
    record: UiRequestRecord,
    resolver: oneshot::Sender<UiResponse>,
}

/// Unsettled requests of one workspace.
#[derive(Default)]
pub struct PendingUiRequests {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingUiRequests {
    fn register(&self, record: UiRequestRecord) -> oneshot::Receiver<UiResponse> {
        let (tx, rx) = oneshot::channel();
        let id = record.request_id.clone();
        let previous = self.entries.lock().insert(
            id,
            PendingEntry {
                record,
                resolver: tx,
            },
        );
        if let Some(old) = previous {
            let _ = old.resolver.send(UiResponse::Cancelled);
        }
        rx
    }

    /// Settle `id` with `response`. Returns `false` when the request is
    /// unknown or already settled.
    pub fn resolve(&self, id: &RequestId, response: UiResponse) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => entry.resolver.send(response).is_ok(),
            None => false,
        }
    }

    /// Whether `id` is still waiting for an answer.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Cancel every request raised by `slot`.
    pub fn cancel_slot(&self, slot: &SlotId) -> usize {
        let cancelled: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, e)| e.record.slot_id == *slot)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let n = cancelled.len();
        for entry in cancelled {
            let _ = entry.resolver.send(UiResponse::Cancelled);
        }
        n
    }

    /// Cancel everything.
    pub fn cancel_all(&self) -> usize {
        let cancelled: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let n = cancelled.len();
        for entry in cancelled {
            let _ = entry.resolver.send(UiResponse::Cancelled);
        }
        n
    }

    /// Unsettled requests, oldest first.
    pub fn records(&self) -> Vec<UiRequestRecord> {
        let mut records: Vec<UiRequestRecord> = self
            .entries
            .lock()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Number of unsettled requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Where a request came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Origin workspace.
    pub workspace_id: WorkspaceId,
    /// Origin slot.
    pub slot_id: SlotId,
}

/// Process-wide request id → origin table.
#[derive(Default)]
pub struct RequestRouter {
    routes: DashMap<RequestId, Route>,
}

impl RequestRouter {
    /// Record the origin of `id`.
    pub fn insert(&self, id: RequestId, route: Route) {
        let _ = self.routes.insert(id, route);
    }

    /// Origin of `id`.
    pub fn get(&self, id: &RequestId) -> Option<Route> {
        self.routes.get(id).map(|r| r.clone())
    }

    /// Forget `id`.
    pub fn remove(&self, id: &RequestId) -> Option<Route> {
        self.routes.remove(id).map(|(_, r)| r)
    }

    /// Number of live routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A slot's handle for raising UI requests.
#[derive(Clone)]
pub struct UiBridge {
    workspace_id: WorkspaceId,
    slot_id: SlotId,
    pending: Arc<PendingUiRequests>,
    router: Arc<RequestRouter>,
    sink: Arc<dyn EventSink>,
    default_timeout: Option<Duration>,
}

impl UiBridge {
    /// Bridge for `slot_id` in `workspace_id`.
    pub fn new(
        workspace_id: WorkspaceId,
        slot_id: SlotId,
        pending: Arc<PendingUiRequests>,
        router: Arc<RequestRouter>,
        sink: Arc<dyn EventSink>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            workspace_id,
            slot_id,
            pending,
            router,
            sink,
            default_timeout,
        }
    }

    /// Slot this bridge belongs to.
    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    /// Ask the user and wait for the answer.
    ///
    /// `timeout` overrides the configured default; `cancel` settles the
    /// request as cancelled when triggered.
    pub async fn request(
        &self,
        request: UiRequest,
        timeout: Option<Duration>,
        cancel: Option<CancellationToken>,
    ) -> UiResponse {
        let id = request.id.clone();
        let record = UiRequestRecord {
            request_id: id.clone(),
            kind: request.kind,
            slot_id: self.slot_id.clone(),
            method: request.method,
            payload: request.payload,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let data = json!({
            "requestId": record.request_id,
            "method": record.method,
            "payload": record.payload,
        });

        let mut rx = self.pending.register(record);
        self.router.insert(
            id.clone(),
            Route {
                workspace_id: self.workspace_id.clone(),
                slot_id: self.slot_id.clone(),
            },
        );
        self.sink.deliver(WorkspaceEvent::new(
            request.kind.event_type(),
            self.workspace_id.clone(),
            Some(self.slot_id.clone()),
            data,
        ));

        let timeout = timeout.or(self.default_timeout);
        let cancel = cancel.unwrap_or_default();
        let sleep = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let (response, outcome) = tokio::select! {
            result = &mut rx => match result {
                Ok(UiResponse::Value(v)) => (UiResponse::Value(v), "answered"),
                Ok(UiResponse::Cancelled) | Err(_) => (UiResponse::Cancelled, "cancelled"),
            },
            () = sleep => self.abandon(&id, &mut rx, "timeout"),
            () = cancel.cancelled() => self.abandon(&id, &mut rx, "cancelled"),
        };

        let _ = self.router.remove(&id);
        debug!(request_id = %id, slot_id = %self.slot_id, outcome, "UI request settled");
        self.sink.deliver(WorkspaceEvent::new(
            event_types::UI_REQUEST_SETTLED,
            self.workspace_id.clone(),
            Some(self.slot_id.clone()),
            json!({ "requestId": id, "outcome": outcome }),
        ));
        response
    }

    /// Settle as cancelled unless a response won the race.
    fn abandon(
        &self,
        id: &RequestId,
        rx: &mut oneshot::Receiver<UiResponse>,
        reason: &'static str,
    ) -> (UiResponse, &'static str) {
        if self.pending.resolve(id, UiResponse::Cancelled) {
            return (UiResponse::Cancelled, reason);
        }
        match rx.try_recv() {
            Ok(UiResponse::Value(v)) => (UiResponse::Value(v), "answered"),
            _ => (UiResponse::Cancelled, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::events::RecordingSink;

    struct Fixture {
        pending: Arc<PendingUiRequests>,
        router: Arc<RequestRouter>,
        sink: Arc<RecordingSink>,
        bridge: UiBridge,
    }

    fn fixture(default_timeout: Option<Duration>) -> Fixture {
        let pending = Arc::new(PendingUiRequests::default());
        let router = Arc::new(RequestRouter::default());
        let sink = Arc::new(RecordingSink::default());
        let bridge = UiBridge::new(
            WorkspaceId::from("ws"),
            SlotId::from("s1"),
            Arc::clone(&pending),
            Arc::clone(&router),
            sink.clone(),
            default_timeout,
        );
        Fixture {
            pending,
            router,
            sink,
            bridge,
        }
    }

    fn confirm(id: &str) -> UiRequest {
        UiRequest {
            id: RequestId::from(id),
            kind: UiRequestKind::Extension,
            method: "confirm".into(),
            payload: json!({"title": "Proceed?"}),
        }
    }

    async fn wait_registered(pending: &PendingUiRequests, id: &str) {
        let id = RequestId::from(id);
        for _ in 0..100 {
            if pending.contains(&id) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("request {id} never registered");
    }

    #[tokio::test]
    async fn response_resolves_request_and_clears_route() {
        let f = fixture(None);
        let bridge = f.bridge.clone();
        let task = tokio::spawn(async move { bridge.request(confirm("r1"), None, None).await });
        wait_registered(&f.pending, "r1").await;

        let route = f.router.get(&RequestId::from("r1")).unwrap();
        assert_eq!(route.slot_id.as_str(), "s1");
        assert_eq!(f.sink.of_type(event_types::EXTENSION_UI_REQUEST).len(), 1);
        assert_eq!(f.pending.records()[0].method, "confirm");

        assert!(f.pending.resolve(&RequestId::from("r1"), UiResponse::Value(json!(true))));
        assert_eq!(task.await.unwrap(), UiResponse::Value(json!(true)));
        assert!(f.router.is_empty());
        assert!(f.pending.is_empty());

        let settled = f.sink.of_type(event_types::UI_REQUEST_SETTLED);
        assert_eq!(settled[0].data["outcome"], "answered");
    }

    #[tokio::test]
    async fn second_response_is_stale() {
        let f = fixture(None);
        let bridge = f.bridge.clone();
        let task = tokio::spawn(async move { bridge.request(confirm("r1"), None, None).await });
        wait_registered(&f.pending, "r1").await;
        assert!(f.pending.resolve(&RequestId::from("r1"), UiResponse::Value(json!(1))));
        assert!(!f.pending.resolve(&RequestId::from("r1"), UiResponse::Value(json!(2))));
        assert_eq!(task.await.unwrap(), UiResponse::Value(json!(1)));
    }

    #[tokio::test]
    async fn unknown_response_is_a_no_op() {
        let f = fixture(None);
        assert!(!f.pending.resolve(&RequestId::from("tool-call-9"), UiResponse::Value(json!({}))));
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels() {
        let f = fixture(Some(Duration::from_secs(30)));
        let response = f.bridge.request(confirm("r1"), None, None).await;
        assert_eq!(response, UiResponse::Cancelled);
        assert!(f.pending.is_empty());
        assert!(f.router.is_empty());
        let settled = f.sink.of_type(event_types::UI_REQUEST_SETTLED);
        assert_eq!(settled[0].data["outcome"], "timeout");
    }

    #[tokio::test]
    async fn cancellation_token_cancels() {
        let f = fixture(None);
        let token = CancellationToken::new();
        let bridge = f.bridge.clone();
        let child = token.clone();
        let task = tokio::spawn(async move { bridge.request(confirm("r1"), None, Some(child)).await });
        wait_registered(&f.pending, "r1").await;
        token.cancel();
        assert_eq!(task.await.unwrap(), UiResponse::Cancelled);
        assert!(f.router.is_empty());
    }

    #[tokio::test]
    async fn cancel_slot_only_touches_that_slot() {
        let f = fixture(None);
        let bridge = f.bridge.clone();
        let task = tokio::spawn(async move { bridge.request(confirm("r1"), None, None).await });
        wait_registered(&f.pending, "r1").await;
        assert_eq!(f.pending.cancel_slot(&SlotId::from("other")), 0);
        assert_eq!(f.pending.cancel_slot(&SlotId::from("s1")), 1);
        assert_eq!(task.await.unwrap(), UiResponse::Cancelled);
    }

    #[test]
    fn kinds_map_to_event_types() {
        assert_eq!(UiRequestKind::Extension.event_type(), "extensionUiRequest");
        assert_eq!(UiRequestKind::Questionnaire.event_type(), event_types::QUESTIONNAIRE_REQUEST);
    }
}
