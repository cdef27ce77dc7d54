//! Server role: accepts rover links and keeps one session per rover.
//!
//! - [`link`]: link ids and the registry-side link handle.
//! - [`registry`]: the session registry (registration, liveness, commands).
//! - [`connection`]: per-link WebSocket task.
//! - [`handler`]: the `/ws` upgrade endpoint.
//! - [`sweep`]: optional eviction of silent links.

pub mod connection;
pub mod handler;
pub mod link;
pub mod registry;
pub mod sweep;

pub use link::{LinkHandle, LinkId, LinkReceiver, LinkSendError};
pub use registry::{
    LINK_UNAVAILABLE, PendingCommand, SESSION_CLOSED, SESSION_SUPERSEDED, SessionInfo,
    SessionRegistry,
};
pub use sweep::run_liveness_sweep;
