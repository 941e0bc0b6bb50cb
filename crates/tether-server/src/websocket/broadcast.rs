//! Event fan-out to connected WebSocket clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::RwLock;
use tether_core::{ClientId, EventSink, WorkspaceEvent, WorkspaceId};
use tracing::{debug, warn};

use super::connection::ClientConnection;

/// Connected clients, and the live [`EventSink`] of every workspace.
#[derive(Default)]
pub struct BroadcastManager {
    connections: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
    dropped: AtomicU64,
}

impl BroadcastManager {
    /// No connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
    }

    /// Remove a connection.
    pub fn remove(&self, id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.connections.write().remove(id)
    }

    /// Send `event` to every client attached to its workspace.
    pub fn broadcast_to_workspace(&self, event: &WorkspaceEvent) {
        let Some(json) = serialize(event) else { return };
        let conns = self.connections.read();
        let mut recipients = 0usize;
        for conn in conns.values() {
            if !conn.is_attached(&event.workspace_id) {
                continue;
            }
            recipients += 1;
            if !conn.send_event(Arc::clone(&json)) {
                self.record_drop(conn, event);
            }
        }
        debug!(
            event_type = %event.event_type,
            workspace_id = %event.workspace_id,
            recipients,
            "broadcast event to workspace"
        );
    }

    fn record_drop(&self, conn: &ClientConnection, event: &WorkspaceEvent) {
        let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!("broadcast_events_dropped_total").increment(1);
        warn!(
            client_id = %conn.id,
            event_type = %event.event_type,
            "client channel full, event dropped"
        );
    }

    /// Number of connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Connections attached to `workspace`.
    pub fn workspace_connections(&self, workspace: &WorkspaceId) -> Vec<Arc<ClientConnection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_attached(workspace))
            .cloned()
            .collect()
    }

    /// Events dropped across all clients.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for BroadcastManager {
    fn deliver(&self, event: WorkspaceEvent) {
        self.broadcast_to_workspace(&event);
    }
}

fn serialize(event: &WorkspaceEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!(event_type = %event.event_type, error = %e, "failed to serialize event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connection(id: &str, capacity: usize) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(ClientConnection::new(ClientId::from(id), tx)), rx)
    }

    fn event(workspace: &str, event_type: &str) -> WorkspaceEvent {
        WorkspaceEvent::new(event_type, WorkspaceId::from(workspace), None, json!({}))
    }

    #[test]
    fn add_and_remove() {
        let bm = BroadcastManager::new();
        let (conn, _rx) = connection("c1", 8);
        bm.add(conn);
        assert_eq!(bm.connection_count(), 1);
        assert!(bm.remove(&ClientId::from("c1")).is_some());
        assert!(bm.remove(&ClientId::from("c1")).is_none());
        assert_eq!(bm.connection_count(), 0);
    }

    #[tokio::test]
    async fn workspace_events_reach_attached_clients_only() {
        let bm = BroadcastManager::new();
        let (a, mut rx_a) = connection("a", 8);
        let (b, mut rx_b) = connection("b", 8);
        a.attach(&WorkspaceId::from("w1"));
        b.attach(&WorkspaceId::from("w2"));
        bm.add(a);
        bm.add(b);

        bm.deliver(event("w1", "messageUpdate"));

        let got: serde_json::Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(got["type"], "messageUpdate");
        assert_eq!(got["workspaceId"], "w1");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn full_clients_count_drops() {
        let bm = BroadcastManager::new();
        let (a, _rx) = connection("a", 1);
        a.attach(&WorkspaceId::from("w1"));
        bm.add(Arc::clone(&a));
        bm.deliver(event("w1", "one"));
        bm.deliver(event("w1", "two"));
        bm.deliver(event("w1", "three"));
        assert_eq!(bm.dropped_count(), 2);
        assert_eq!(a.drop_count(), 2);
    }

    #[test]
    fn drops_are_exported_under_metric_name() {
        use crate::metrics::BROADCAST_EVENTS_DROPPED_TOTAL;
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let bm = BroadcastManager::new();
        let (a, _rx) = connection("a", 1);
        a.attach(&WorkspaceId::from("w1"));
        bm.add(a);
        metrics::with_local_recorder(&recorder, || {
            bm.deliver(event("w1", "one"));
            bm.deliver(event("w1", "two"));
        });
        let rendered = handle.render();
        assert!(rendered.contains(&format!("{BROADCAST_EVENTS_DROPPED_TOTAL} 1")), "{rendered}");
    }

    #[test]
    fn workspace_connections_filters() {
        let bm = BroadcastManager::new();
        let (a, _ra) = connection("a", 8);
        let (b, _rb) = connection("b", 8);
        a.attach(&WorkspaceId::from("w1"));
        bm.add(a);
        bm.add(b);
        let attached = bm.workspace_connections(&WorkspaceId::from("w1"));
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, ClientId::from("a"));
    }
}
