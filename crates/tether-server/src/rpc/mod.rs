//! JSON-RPC over WebSocket: wire types, error codes, the method registry,
//! and the handlers behind it.

pub mod context;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod types;
pub mod validation;
