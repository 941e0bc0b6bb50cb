//! WebSocket client connection state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tether_core::{ClientId, WorkspaceId};
use tokio::sync::mpsc;

#[derive(Default)]
struct Routing {
    /// Live events are queued instead of sent while an open is in flight.
    held: bool,
    queued: Vec<Arc<String>>,
    /// Attach count per workspace; the same socket may open a path twice.
    workspaces: HashMap<WorkspaceId, usize>,
}

/// One connected WebSocket client.
pub struct ClientConnection {
    /// Connection id.
    pub id: ClientId,
    tx: mpsc::Sender<Arc<String>>,
    routing: Mutex<Routing>,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Connection writing to `tx`.
    pub fn new(id: ClientId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            routing: Mutex::new(Routing::default()),
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Send a response or control message immediately.
    ///
    /// Returns `false` (and counts a drop) when the channel is full or closed.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize a JSON value and send it.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Deliver a live workspace event, queueing it while held.
    pub fn send_event(&self, message: Arc<String>) -> bool {
        let mut routing = self.routing.lock();
        if routing.held {
            routing.queued.push(message);
            return true;
        }
        drop(routing);
        self.send(message)
    }

    /// Queue live events until [`release`](Self::release).
    pub fn hold(&self) {
        self.routing.lock().held = true;
    }

    /// Flush queued events and resume live delivery. Returns how many
    /// events were flushed.
    pub fn release(&self) -> usize {
        let mut routing = self.routing.lock();
        routing.held = false;
        let queued = std::mem::take(&mut routing.queued);
        let count = queued.len();
        // Still under the lock so a concurrent live event cannot overtake.
        for message in queued {
            let _ = self.send(message);
        }
        count
    }

    /// Whether live events are currently held.
    pub fn is_held(&self) -> bool {
        self.routing.lock().held
    }

    /// Record one more attach to `workspace`.
    pub fn attach(&self, workspace: &WorkspaceId) {
        *self
            .routing
            .lock()
            .workspaces
            .entry(workspace.clone())
            .or_insert(0) += 1;
    }

    /// Drop one attach to `workspace`. Returns `false` if it was not attached.
    pub fn detach(&self, workspace: &WorkspaceId) -> bool {
        let mut routing = self.routing.lock();
        match routing.workspaces.get_mut(workspace) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                let _ = routing.workspaces.remove(workspace);
                true
            }
            None => false,
        }
    }

    /// Forget `workspace` entirely (it was closed).
    pub fn forget(&self, workspace: &WorkspaceId) {
        let _ = self.routing.lock().workspaces.remove(workspace);
    }

    /// Whether events of `workspace` reach this client.
    pub fn is_attached(&self, workspace: &WorkspaceId) -> bool {
        self.routing.lock().workspaces.contains_key(workspace)
    }

    /// Attached workspaces with their counts, clearing them. Used on disconnect.
    pub fn take_workspaces(&self) -> Vec<(WorkspaceId, usize)> {
        self.routing.lock().workspaces.drain().collect()
    }

    /// Mark the connection as alive (pong received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag. `true` if a pong arrived since the
    /// last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Messages dropped because the channel was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}
