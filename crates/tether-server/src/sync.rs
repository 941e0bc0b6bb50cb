//! Durable last-known state per workspace.
//!
//! State-bearing events (queue contents, plan and job listings, slot
//! lifecycle) are written to SQLite keyed by `(workspace path, state key)`.
//! Only the latest value per key is kept, stamped with a sequence number
//! that increases across the whole database, so a client can ask for a
//! snapshot and then apply live events newer than its `seq`.
//!
//! Writes travel through an unbounded channel to one blocking writer task;
//! event delivery never waits on disk.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::Serialize;
use serde_json::Value;
use tether_core::{EventSink, WorkspaceEvent, WorkspaceId, event_types};
use tether_runtime::WorkspaceObserver;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Event types whose latest value is persisted.
pub const TRACKED_EVENTS: &[&str] = &[
    event_types::QUEUED_MESSAGES,
    event_types::PLANS_UPDATED,
    event_types::ACTIVE_PLAN,
    event_types::JOBS_UPDATED,
    event_types::ACTIVE_JOBS,
    event_types::SLOT_CREATED,
    event_types::SLOT_CLOSED,
];

/// Snapshot store errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored value is not valid JSON.
    #[error("invalid stored value: {0}")]
    Json(#[from] serde_json::Error),
    /// Could not create the database directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Latest value of one state key.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// State key, e.g. `plansUpdated` or `slot/review-1`.
    pub key: String,
    /// Event type that produced the value.
    pub event_type: String,
    /// Event payload.
    pub data: Value,
    /// Sequence of the write.
    pub seq: i64,
    /// Event timestamp (RFC 3339).
    pub updated_at: String,
}

/// Every entry of one workspace.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Entries ordered by `seq`.
    pub entries: Vec<SnapshotEntry>,
    /// Highest `seq` among the entries, `0` when empty.
    pub seq: i64,
}

/// State key for `event`, or `None` when it is not persisted.
///
/// Slot-scoped state is keyed per slot; `slotCreated` and `slotClosed` share
/// a key so the later one wins.
pub fn state_key(event: &WorkspaceEvent) -> Option<String> {
    let kind = event.event_type.as_str();
    if !TRACKED_EVENTS.contains(&kind) {
        return None;
    }
    let slot = event.session_slot_id.as_ref().map_or("", |s| s.as_str());
    Some(match kind {
        event_types::QUEUED_MESSAGES => format!("{kind}/{slot}"),
        event_types::SLOT_CREATED | event_types::SLOT_CLOSED => format!("slot/{slot}"),
        _ => kind.to_owned(),
    })
}

/// SQLite-backed snapshot table.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
    seq: AtomicI64,
}

impl SnapshotStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), seq = store.current_seq(), "snapshot store opened");
        Ok(store)
    }

    /// In-memory database.
    pub fn open_in_memory() -> Result<Self, SyncError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SyncError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                workspace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data       TEXT NOT NULL,
                seq        INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace, key)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_seq ON snapshots (workspace, seq);",
        )?;
        let max: Option<i64> = conn.query_row("SELECT MAX(seq) FROM snapshots", [], |row| row.get(0))?;
        Ok(Self {
            conn: Mutex::new(conn),
            seq: AtomicI64::new(max.unwrap_or(0)),
        })
    }

    /// Highest sequence written so far.
    pub fn current_seq(&self) -> i64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Replace the value of `key` for `workspace`. Returns the new sequence.
    pub fn put(
        &self,
        workspace: &str,
        key: &str,
        event_type: &str,
        data: &Value,
        updated_at: &str,
    ) -> Result<i64, SyncError> {
        let json = serde_json::to_string(data)?;
        let conn = self.conn.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = conn.execute(
            "INSERT INTO snapshots (workspace, key, event_type, data, seq, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (workspace, key) DO UPDATE SET
                event_type = excluded.event_type,
                data = excluded.data,
                seq = excluded.seq,
                updated_at = excluded.updated_at",
            params![workspace, key, event_type, json, seq, updated_at],
        )?;
        Ok(seq)
    }

    /// Every entry stored for `workspace`.
    pub fn snapshot(&self, workspace: &str) -> Result<Snapshot, SyncError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key, event_type, data, seq, updated_at FROM snapshots
             WHERE workspace = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![workspace], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (key, event_type, data, seq, updated_at) = row?;
            entries.push(SnapshotEntry {
                key,
                event_type,
                data: serde_json::from_str(&data)?,
                seq,
                updated_at,
            });
        }
        let seq = entries.last().map_or(0, |e| e.seq);
        Ok(Snapshot { entries, seq })
    }

    /// Delete everything stored for `workspace`. Returns the row count.
    pub fn clear(&self, workspace: &str) -> Result<usize, SyncError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM snapshots WHERE workspace = ?1", params![workspace])?)
    }
}

struct SnapshotWrite {
    workspace: String,
    key: String,
    event: WorkspaceEvent,
}

/// Workspace observer feeding the store's writer task.
#[derive(Clone)]
pub struct SnapshotRecorder {
    tx: mpsc::UnboundedSender<SnapshotWrite>,
}

impl SnapshotRecorder {
    /// Start the writer. It runs until every recorder clone is dropped.
    pub fn spawn(store: Arc<SnapshotStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SnapshotWrite>();
        let handle = tokio::task::spawn_blocking(move || {
            while let Some(write) = rx.blocking_recv() {
                let result = store.put(
                    &write.workspace,
                    &write.key,
                    &write.event.event_type,
                    &write.event.data,
                    &write.event.timestamp,
                );
                match result {
                    Ok(seq) => {
                        counter!("sync_writes_total").increment(1);
                        debug!(workspace = %write.workspace, key = %write.key, seq, "snapshot written");
                    }
                    Err(e) => {
                        warn!(workspace = %write.workspace, key = %write.key, error = %e, "snapshot write failed");
                    }
                }
            }
            debug!("snapshot writer stopped");
        });
        (Self { tx }, handle)
    }
}

impl WorkspaceObserver for SnapshotRecorder {
    fn sink_for(&self, _id: &WorkspaceId, root: &Path) -> Arc<dyn EventSink> {
        Arc::new(WorkspaceRecorder {
            workspace: root.display().to_string(),
            tx: self.tx.clone(),
        })
    }
}

struct WorkspaceRecorder {
    workspace: String,
    tx: mpsc::UnboundedSender<SnapshotWrite>,
}

impl EventSink for WorkspaceRecorder {
    fn deliver(&self, event: WorkspaceEvent) {
        let Some(key) = state_key(&event) else { return };
        let write = SnapshotWrite {
            workspace: self.workspace.clone(),
            key,
            event,
        };
        if self.tx.send(write).is_err() {
            debug!(workspace = %self.workspace, "snapshot writer gone, state not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::SlotId;
    use tether_runtime::testutil::wait_until;

    fn event(kind: &str, slot: Option<&str>, data: Value) -> WorkspaceEvent {
        WorkspaceEvent::new(kind, WorkspaceId::from("w1"), slot.map(SlotId::from), data)
    }

    #[test]
    fn state_keys() {
        assert_eq!(state_key(&event("plansUpdated", None, json!([]))).as_deref(), Some("plansUpdated"));
        assert_eq!(
            state_key(&event("queuedMessages", Some("default"), json!({}))).as_deref(),
            Some("queuedMessages/default")
        );
        assert_eq!(
            state_key(&event("slotClosed", Some("r1"), json!({}))),
            state_key(&event("slotCreated", Some("r1"), json!({})))
        );
        assert!(state_key(&event("messageUpdate", Some("default"), json!({}))).is_none());
    }

    #[test]
    fn latest_value_wins() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let first = store.put("/repo", "activePlan", "activePlan", &json!({"v": 1}), "t1").unwrap();
        let other = store.put("/repo", "jobsUpdated", "jobsUpdated", &json!([]), "t2").unwrap();
        let second = store.put("/repo", "activePlan", "activePlan", &json!({"v": 2}), "t3").unwrap();
        assert!(first < other && other < second);

        let snap = store.snapshot("/repo").unwrap();
        assert_eq!(snap.entries.len(), 2);
        assert_eq!(snap.entries[0].key, "jobsUpdated");
        assert_eq!(snap.entries[1].data, json!({"v": 2}));
        assert_eq!(snap.seq, second);
    }

    #[test]
    fn workspaces_are_isolated() {
        let store = SnapshotStore::open_in_memory().unwrap();
        let _ = store.put("/a", "plansUpdated", "plansUpdated", &json!([1]), "t").unwrap();
        assert!(store.snapshot("/b").unwrap().entries.is_empty());
        assert_eq!(store.snapshot("/b").unwrap().seq, 0);
        assert_eq!(store.clear("/a").unwrap(), 1);
        assert!(store.snapshot("/a").unwrap().entries.is_empty());
    }

    #[test]
    fn sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");
        let seq = {
            let store = SnapshotStore::open(&path).unwrap();
            let _ = store.put("/repo", "a", "activePlan", &Value::Null, "t").unwrap();
            store.put("/repo", "b", "activeJobs", &json!([]), "t").unwrap()
        };
        let store = SnapshotStore::open(&path).unwrap();
        assert_eq!(store.current_seq(), seq);
        assert!(store.put("/repo", "a", "activePlan", &Value::Null, "t").unwrap() > seq);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recorder_persists_tracked_events_only() {
        let store = Arc::new(SnapshotStore::open_in_memory().unwrap());
        let (recorder, _writer) = SnapshotRecorder::spawn(Arc::clone(&store));
        let sink = recorder.sink_for(&WorkspaceId::from("w1"), Path::new("/repo"));

        sink.deliver(event("messageUpdate", Some("default"), json!({"delta": "x"})));
        sink.deliver(event("queuedMessages", Some("default"), json!({"steering": ["a"]})));
        sink.deliver(event("activeJobs", None, json!([])));

        wait_until(|| store.snapshot("/repo").unwrap().entries.len() == 2).await;
        let keys: Vec<String> = store
            .snapshot("/repo")
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, ["queuedMessages/default", "activeJobs"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writer_stops_when_recorders_drop() {
        let store = Arc::new(SnapshotStore::open_in_memory().unwrap());
        let (recorder, writer) = SnapshotRecorder::spawn(store);
        let sink = recorder.sink_for(&WorkspaceId::from("w1"), Path::new("/repo"));
        drop(recorder);
        drop(sink);
        tokio::time::timeout(std::time::Duration::from_secs(2), writer)
            .await
            .unwrap()
            .unwrap();
    }
}
