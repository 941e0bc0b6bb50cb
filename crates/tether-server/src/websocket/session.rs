//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tether_core::ClientId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::handle_message;
use crate::rpc::context::RpcContext;
use crate::rpc::registry::MethodRegistry;

/// Socket timing and queue settings.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Silence after which the client is dropped.
    pub pong_timeout: Duration,
    /// Outbound queue depth.
    pub send_queue_capacity: usize,
}

/// `connection.established` greeting.
pub fn established_message(client_id: &ClientId) -> serde_json::Value {
    json!({
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": { "clientId": client_id },
    })
}

/// Run a WebSocket session for a connected client.
///
/// Responses are sent in request order. After each response the connection
/// is released, flushing live events held back by `workspace.open`.
#[instrument(skip_all, fields(client_id = %client_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    client_id: ClientId,
    registry: Arc<MethodRegistry>,
    base: RpcContext,
    options: SessionOptions,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(options.send_queue_capacity.max(1));
    let connection = Arc::new(ClientConnection::new(client_id.clone(), send_tx));
    let ctx = base.for_connection(Arc::clone(&connection));

    let started = Instant::now();
    info!("client connected");
    counter!("ws_connections_total").increment(1);
    gauge!("ws_connections_active").increment(1.0);

    ctx.broadcast.add(Arc::clone(&connection));
    let _ = connection.send_json(&established_message(&client_id));

    let outbound_conn = Arc::clone(&connection);
    let outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(options.ping_interval);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_pong_elapsed() > options.pong_timeout
                    {
                        warn!(timeout = ?options.pong_timeout, "client unresponsive, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = shutdown.cancelled() => {
                debug!("server shutting down, closing session");
                break;
            }
        };
        let Some(Ok(msg)) = msg else { break };

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                connection.mark_alive();
                continue;
            }
        };
        connection.mark_alive();

        let result = handle_message(&text, &registry, &ctx).await;
        if !connection.send(Arc::new(result.response_json)) {
            warn!(method = %result.method, "failed to enqueue response");
        }
        let flushed = connection.release();
        if flushed > 0 {
            debug!(flushed, "released held events");
        }
    }

    cleanup(&ctx, &connection);
    info!(elapsed = ?started.elapsed(), dropped = connection.drop_count(), "client disconnected");
    counter!("ws_disconnections_total").increment(1);
    gauge!("ws_connections_active").decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
    outbound.abort();
}

/// Detach from every workspace the connection still holds, then unregister.
fn cleanup(ctx: &RpcContext, connection: &Arc<ClientConnection>) {
    let _ = ctx.broadcast.remove(&connection.id);
    for (workspace, count) in connection.take_workspaces() {
        for _ in 0..count {
            if let Err(e) = ctx.manager.detach(&workspace) {
                debug!(workspace_id = %workspace, error = %e, "detach on disconnect skipped");
                break;
            }
        }
    }
}
