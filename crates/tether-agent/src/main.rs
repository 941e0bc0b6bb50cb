//! # tether
//!
//! Server binary: loads settings, wires the workspace manager to the
//! WebSocket server and runs until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::logging::{LogFormat, init_subscriber};
use tether_runtime::{ManagerConfig, ProcessRuntimeFactory, WorkspaceManager};
use tether_settings::TetherSettings;
use tether_settings::loader::{load_settings_from_path, settings_path, tether_home};
use tether_server::config::ServerConfig;
use tether_server::server::TetherServer;
use tether_server::shutdown::{DEFAULT_DRAIN_TIMEOUT, wait_for_signal};
use tether_server::sync::{SnapshotRecorder, SnapshotStore};
use tether_server::websocket::broadcast::BroadcastManager;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Tether workspace server.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Workspace server for coding-agent sessions")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long, env = "TETHER_HOST")]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long, env = "TETHER_PORT")]
    port: Option<u16>,

    /// Settings file.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Do not persist state snapshots.
    #[arg(long)]
    no_sync: bool,
}

impl Cli {
    fn server_config(&self, settings: &TetherSettings) -> ServerConfig {
        let mut config = ServerConfig::from_settings(&settings.server);
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

/// Snapshot database location: absolute paths are kept, relative ones are
/// resolved under `home`.
fn resolve_db_path(home: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

/// Everything `main` needs to run and stop the server.
struct Services {
    server: TetherServer,
    manager: Arc<WorkspaceManager>,
    snapshot_writer: Option<JoinHandle<()>>,
}

fn build_services(
    settings: &TetherSettings,
    config: ServerConfig,
    snapshots: Option<Arc<SnapshotStore>>,
) -> Services {
    let broadcast = Arc::new(BroadcastManager::new());
    let factory = Arc::new(ProcessRuntimeFactory::new(&settings.agent));
    let mut manager = WorkspaceManager::new(
        ManagerConfig::from_settings(settings),
        factory,
        broadcast.clone(),
    );

    let mut snapshot_writer = None;
    if let Some(store) = &snapshots {
        let (recorder, handle) = SnapshotRecorder::spawn(Arc::clone(store));
        manager = manager.with_observer(recorder);
        snapshot_writer = Some(handle);
    }

    let manager = Arc::new(manager);
    let server = TetherServer::new(config, Arc::clone(&manager), broadcast, snapshots);
    Services {
        server,
        manager,
        snapshot_writer,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let format = if args.json_logs { LogFormat::Json } else { LogFormat::Compact };
    init_subscriber(&args.log_level, format);

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    let metrics = match tether_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let snapshots = if args.no_sync {
        None
    } else {
        let db_path = resolve_db_path(&tether_home(), &settings.sync.db_path);
        let store = SnapshotStore::open(&db_path)
            .with_context(|| format!("Failed to open snapshot store at {}", db_path.display()))?;
        Some(Arc::new(store))
    };

    let config = args.server_config(&settings);
    let Services {
        server,
        manager,
        snapshot_writer,
    } = build_services(&settings, config, snapshots);
    let server = match metrics {
        Some(handle) => server.with_metrics(handle),
        None => server,
    };

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!(%addr, agent = %settings.agent.command, "tether listening on ws://{addr}/ws");
    server.shutdown().track("http", handle);

    wait_for_signal().await;

    info!("shutting down");
    server.shutdown().shutdown();
    manager.shutdown().await;
    server.shutdown().drain(DEFAULT_DRAIN_TIMEOUT).await;
    drop(server);
    drop(manager);
    if let Some(writer) = snapshot_writer {
        // Ends once the last recorder handle is dropped.
        if tokio::time::timeout(DEFAULT_DRAIN_TIMEOUT, writer).await.is_err() {
            warn!("snapshot writer did not finish in time");
        }
    }

    info!("shutdown complete");
    Ok(())
}
