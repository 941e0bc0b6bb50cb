//! `TetherServer`: axum HTTP + WebSocket front end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::ClientId;
use tether_runtime::WorkspaceManager;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::rpc::context::RpcContext;
use crate::rpc::handlers::register_all;
use crate::rpc::registry::MethodRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::sync::SnapshotStore;
use crate::websocket::broadcast::BroadcastManager;
use crate::websocket::session::{SessionOptions, run_ws_session};

/// Shared state of the axum handlers.
#[derive(Clone)]
pub struct AppState {
    ctx: RpcContext,
    registry: Arc<MethodRegistry>,
    config: Arc<ServerConfig>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

/// The server.
pub struct TetherServer {
    state: AppState,
}

impl TetherServer {
    /// Server over `manager`, with every RPC method registered.
    ///
    /// `broadcast` must be the live sink `manager` was built with.
    pub fn new(
        config: ServerConfig,
        manager: Arc<WorkspaceManager>,
        broadcast: Arc<BroadcastManager>,
        snapshots: Option<Arc<SnapshotStore>>,
    ) -> Self {
        let mut registry = MethodRegistry::new();
        register_all(&mut registry);
        let ctx = RpcContext::new(manager, broadcast, snapshots);
        Self {
            state: AppState {
                start_time: ctx.server_start_time,
                ctx,
                registry: Arc::new(registry),
                config: Arc::new(config),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind and serve until shutdown begins.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let config = &self.state.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "server stopped with error");
            }
        });
        info!(%local, methods = self.state.registry.methods().len(), "tether server listening");
        Ok((local, handle))
    }

    /// Handler context (unbound to any connection).
    pub fn context(&self) -> &RpcContext {
        &self.state.ctx
    }

    /// Broadcast manager.
    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.state.ctx.broadcast
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Method registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.state.registry
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = &state.ctx.manager;
    Json(health::health_check(
        state.start_time,
        state.ctx.broadcast.connection_count(),
        manager.workspace_count(),
        manager.active_workspaces().len(),
    ))
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let config = &state.config;
    let connections = state.ctx.broadcast.connection_count();
    if connections >= config.max_connections {
        warn!(connections, limit = config.max_connections, "connection limit reached, rejecting upgrade");
        counter!("ws_connections_rejected_total").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let options = SessionOptions {
        ping_interval: config.heartbeat_interval(),
        pong_timeout: config.pong_timeout(),
        send_queue_capacity: config.send_queue_capacity,
    };
    let registry = Arc::clone(&state.registry);
    let ctx = state.ctx.clone();
    let token = state.shutdown.token();
    ws.max_message_size(config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, ClientId::new(), registry, ctx, options, token))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };
    #[allow(clippy::cast_precision_loss)]
    gauge!("workspaces_open").set(state.ctx.manager.workspace_count() as f64);
    handle.render().into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tether_runtime::ManagerConfig;
    use tether_runtime::testutil::MockFactory;
    use tower::ServiceExt;

    fn make_server(config: ServerConfig) -> TetherServer {
        let broadcast = Arc::new(BroadcastManager::new());
        let manager = Arc::new(WorkspaceManager::new(
            ManagerConfig::default(),
            Arc::new(MockFactory::new()),
            broadcast.clone(),
        ));
        TetherServer::new(config, manager, broadcast, None)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn registers_every_method() {
        let server = make_server(ServerConfig::default());
        assert!(server.registry().has_method("workspace.open"));
        assert!(server.registry().has_method("sync.snapshot"));
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let server = make_server(ServerConfig::default());
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["workspaces"], 0);
        assert!(body.get("uptimeSecs").is_some());
        assert!(body.get("activeWorkspaces").is_some());
    }

    #[tokio::test]
    async fn ws_requires_upgrade() {
        let server = make_server(ServerConfig::default());
        let resp = server
            .router()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn metrics_disabled_without_handle() {
        let server = make_server(ServerConfig::default());
        let (status, _) = get_json(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(ServerConfig::default());
        let (status, _) = get_json(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server(ServerConfig::default());
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
