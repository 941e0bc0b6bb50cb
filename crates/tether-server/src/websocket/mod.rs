//! WebSocket connections, message dispatch, and per-workspace fan-out.

pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod session;
