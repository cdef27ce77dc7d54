//! # rover-link
//!
//! Session manager relaying telemetry and commands between rovers and a
//! central server over persistent WebSocket links.
//!
//! The crate holds both ends of a link:
//!
//! - the **rover agent** ([`agent`]): a pure connection state machine and a
//!   tokio runtime that keeps one link to the server alive, streams
//!   telemetry, answers commands and reconnects at a fixed interval;
//! - the **server** ([`server`]): a session registry binding each link to a
//!   rover identity, dispatching commands and correlating their responses,
//!   plus a REST API ([`api`]) for operators.
//!
//! ## Architecture
//!
//! ```text
//! rover-agent                          rover-link server
//!   AgentSession (agent/)                REST handlers (api/)
//!     │                                    │
//!   runtime ── WebSocket frames ──▶ /ws ── SessionRegistry (server/)
//!     │        (protocol/)                 │
//!   RoverBridge                          Storage (storage/)
//!                                          ├── MemoryStorage
//!                                          └── PostgresStorage
//! ```

pub mod agent;
pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod storage;
