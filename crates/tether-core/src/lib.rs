//! # tether-core
//!
//! Shared vocabulary for the tether crates:
//!
//! - **Branded IDs**: `WorkspaceId`, `SlotId`, `RequestId`, `ClientId`
//! - **Events**: `RuntimeEvent` from session runtimes, `WorkspaceEvent`
//!   envelopes for clients, and the `EventSink` delivery trait
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;

pub use events::{EventSink, NullSink, RuntimeEvent, WorkspaceEvent, event_types};
pub use ids::{ClientId, DEFAULT_SLOT, RequestId, SlotId, WorkspaceId};
