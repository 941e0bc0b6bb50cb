//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server runs.
    pub status: String,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// WebSocket connections.
    pub connections: usize,
    /// Open workspaces.
    pub workspaces: usize,
    /// Workspaces with a running agent.
    pub active_workspaces: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    workspaces: usize,
    active_workspaces: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        workspaces,
        active_workspaces,
    }
}
