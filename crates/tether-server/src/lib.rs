//! # tether-server
//!
//! Axum HTTP + `WebSocket` transport over the workspace manager.
//!
//! - HTTP endpoints: `/health`, `/metrics`, `/ws`
//! - `WebSocket` sessions: heartbeat, RPC dispatch, hold-and-release of live
//!   events around `workspace.open`
//! - Fan-out of workspace events to the connections attached to them
//! - Durable state snapshots in SQLite (`sync`)
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod sync;
pub mod websocket;

pub use config::ServerConfig;
pub use server::TetherServer;
