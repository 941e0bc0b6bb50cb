//! Shared state handed to every RPC handler.

use std::sync::Arc;
use std::time::Instant;

use tether_runtime::WorkspaceManager;

use crate::sync::SnapshotStore;
use crate::websocket::broadcast::BroadcastManager;
use crate::websocket::connection::ClientConnection;

/// Handler context. Cheap to clone; each socket gets its own copy bound to
/// its connection.
#[derive(Clone)]
pub struct RpcContext {
    /// Open workspaces.
    pub manager: Arc<WorkspaceManager>,
    /// Connected clients.
    pub broadcast: Arc<BroadcastManager>,
    /// Durable state snapshots (None = sync disabled).
    pub snapshots: Option<Arc<SnapshotStore>>,
    /// When the server started.
    pub server_start_time: Instant,
    /// Calling connection, when the request came over a socket.
    pub connection: Option<Arc<ClientConnection>>,
}

impl RpcContext {
    /// Context without a bound connection.
    pub fn new(
        manager: Arc<WorkspaceManager>,
        broadcast: Arc<BroadcastManager>,
        snapshots: Option<Arc<SnapshotStore>>,
    ) -> Self {
        Self {
            manager,
            broadcast,
            snapshots,
            server_start_time: Instant::now(),
            connection: None,
        }
    }

    /// Copy bound to `connection`.
    #[must_use]
    pub fn for_connection(&self, connection: Arc<ClientConnection>) -> Self {
        Self {
            connection: Some(connection),
            ..self.clone()
        }
    }
}
