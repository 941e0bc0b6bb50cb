//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial JSON file only needs to
//! name the keys it overrides.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Transport settings.
    pub server: ServerSettings,
    /// Workspace and slot behaviour.
    pub workspace: WorkspaceSettings,
    /// Plan/job discovery and reconciliation.
    pub docs: DocsSettings,
    /// Agent subprocess launched per slot.
    pub agent: AgentSettings,
    /// Durable snapshot store.
    pub sync: SyncSettings,
}

/// HTTP/WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before a client is dropped.
    pub pong_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            pong_timeout_secs: 60,
        }
    }
}

/// Workspace settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceSettings {
    /// Events kept per workspace while no client is attached.
    pub event_buffer_capacity: usize,
    /// Seconds a UI request waits for an answer (`0` waits forever).
    pub ui_request_timeout_secs: u64,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            event_buffer_capacity: 1000,
            ui_request_timeout_secs: 0,
        }
    }
}

/// Plan and job document settings. Directories are relative to the
/// workspace root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocsSettings {
    /// Directories scanned for plan documents.
    pub plan_dirs: Vec<String>,
    /// Directories scanned for job documents.
    pub job_dirs: Vec<String>,
    /// Debounce window for file-system events.
    pub debounce_ms: u64,
    /// Interval of the fingerprint poll.
    pub poll_interval_ms: u64,
}

impl Default for DocsSettings {
    fn default() -> Self {
        Self {
            plan_dirs: vec![".tether/plans".to_string()],
            job_dirs: vec![".tether/jobs".to_string()],
            debounce_ms: 500,
            poll_interval_ms: 3000,
        }
    }
}

/// Agent subprocess settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Executable spawned for each slot.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Seconds to wait for a command response.
    pub request_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "pi".to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
            request_timeout_secs: 120,
        }
    }
}

/// Snapshot store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Database file, relative to `~/.tether` unless absolute.
    pub db_path: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            db_path: "sync.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = TetherSettings::default();
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.workspace.event_buffer_capacity, 1000);
        assert_eq!(s.docs.debounce_ms, 500);
        assert_eq!(s.docs.poll_interval_ms, 3000);
        assert_eq!(s.docs.plan_dirs, vec![".tether/plans"]);
        assert_eq!(s.agent.command, "pi");
    }

    #[test]
    fn camel_case_keys() {
        let value = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(value["workspace"]["eventBufferCapacity"].is_number());
        assert!(value["docs"]["pollIntervalMs"].is_number());
        assert!(value["server"]["heartbeatIntervalSecs"].is_number());
    }

    #[test]
    fn partial_object_fills_defaults() {
        let s: DocsSettings = serde_json::from_str(r#"{"debounceMs": 250}"#).unwrap();
        assert_eq!(s.debounce_ms, 250);
        assert_eq!(s.poll_interval_ms, 3000);
    }
}
