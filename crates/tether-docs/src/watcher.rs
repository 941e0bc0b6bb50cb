//! Watches a workspace's document directories and drives reconciliation.
//!
//! Two independent triggers feed one reconcile task:
//!
//! - a debounced filesystem watcher over every existing document directory
//! - a periodic poll that picks up directories created after start and
//!   compares fingerprints of the active plan and job files, for edits the
//!   filesystem watcher misses (network mounts, editors that swap inodes)
//!
//! Triggers arriving while a pass runs are coalesced into the next pass.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use parking_lot::Mutex;
use tether_settings::DocsSettings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{DocError, Result};
use crate::service::DocsService;

#[derive(Clone, Copy, Debug)]
enum Trigger {
    Startup,
    FileChange,
    DirectoryChange,
    Poll,
}

struct WatchState {
    debouncer: Debouncer<RecommendedWatcher>,
    watched: HashSet<PathBuf>,
}

impl WatchState {
    /// Watch directories that exist and drop ones that vanished.
    /// Returns whether the watched set changed.
    fn sync(&mut self, present: &[(PathBuf, bool)]) -> bool {
        let mut changed = false;
        for (dir, exists) in present {
            let watching = self.watched.contains(dir);
            if *exists && !watching {
                match self.debouncer.watcher().watch(dir, RecursiveMode::Recursive) {
                    Ok(()) => {
                        info!(dir = %dir.display(), "watching document directory");
                        let _ = self.watched.insert(dir.clone());
                        changed = true;
                    }
                    Err(e) => debug!(dir = %dir.display(), error = %e, "watch failed, will retry"),
                }
            } else if !*exists && watching {
                let _ = self.debouncer.watcher().unwatch(dir);
                let _ = self.watched.remove(dir);
                info!(dir = %dir.display(), "document directory removed");
                changed = true;
            }
        }
        changed
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("md")
}

async fn presence(dirs: &[PathBuf]) -> Vec<(PathBuf, bool)> {
    let mut out = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let exists = tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir());
        out.push((dir.clone(), exists));
    }
    out
}

/// Running watcher for one workspace. Stops on [`DocWatcher::stop`] or drop.
pub struct DocWatcher {
    cancel: CancellationToken,
    _state: Arc<Mutex<WatchState>>,
}

impl DocWatcher {
    /// Start watching `service`'s directories and run an initial
    /// reconciliation. Must be called inside a tokio runtime.
    pub async fn start(service: Arc<DocsService>, settings: &DocsSettings) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Trigger>(16);

        let file_tx = tx.clone();
        let debouncer = new_debouncer(
            Duration::from_millis(settings.debounce_ms.max(1)),
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    if events.iter().any(|e| is_markdown(&e.path)) {
                        // Full channel means a pass is already queued.
                        let _ = file_tx.try_send(Trigger::FileChange);
                    }
                }
                Err(e) => warn!(error = %e, "document watcher error"),
            },
        )
        .map_err(|e| DocError::Watch(e.to_string()))?;

        let dirs = service.watch_dirs();
        let state = Arc::new(Mutex::new(WatchState {
            debouncer,
            watched: HashSet::new(),
        }));
        let initial = presence(&dirs).await;
        let _ = state.lock().sync(&initial);

        let cancel = CancellationToken::new();
        let _ = tx.try_send(Trigger::Startup);

        drop(tokio::spawn(reconcile_loop(
            Arc::clone(&service),
            rx,
            cancel.clone(),
        )));
        drop(tokio::spawn(poll_loop(
            service,
            Arc::clone(&state),
            dirs,
            tx,
            Duration::from_millis(settings.poll_interval_ms.max(1)),
            cancel.clone(),
        )));

        Ok(Self {
            cancel,
            _state: state,
        })
    }

    /// Stop both tasks. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether [`DocWatcher::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DocWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn reconcile_loop(
    service: Arc<DocsService>,
    mut rx: mpsc::Receiver<Trigger>,
    cancel: CancellationToken,
) {
    loop {
        let trigger = tokio::select! {
            () = cancel.cancelled() => break,
            trigger = rx.recv() => match trigger {
                Some(t) => t,
                None => break,
            },
        };
        let mut coalesced = 0usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        debug!(
            workspace_id = %service.workspace_id(),
            ?trigger,
            coalesced,
            "reconciling documents"
        );
        service.reconcile().await;
    }
    debug!(workspace_id = %service.workspace_id(), "document reconcile loop stopped");
}

async fn poll_loop(
    service: Arc<DocsService>,
    state: Arc<Mutex<WatchState>>,
    dirs: Vec<PathBuf>,
    tx: mpsc::Sender<Trigger>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let _ = interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let present = presence(&dirs).await;
        if state.lock().sync(&present) {
            let _ = tx.try_send(Trigger::DirectoryChange);
            continue;
        }
        if service.poll_changed().await {
            let _ = tx.try_send(Trigger::Poll);
        }
    }
}
