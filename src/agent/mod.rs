//! Rover-side agent: keeps one link to the server alive and relays
//! telemetry, commands and keepalives over it.
//!
//! - [`session`]: pure state machine, no I/O.
//! - [`runtime`]: tokio/WebSocket driver for the state machine.
//! - [`bridge`]: the onboard collaborator that executes commands.

pub mod bridge;
pub mod runtime;
pub mod session;

pub use bridge::{DispatchFault, RoverBridge, SimulatedBridge};
pub use runtime::{AgentHandle, AgentStatus, CONNECT_TIMEOUT, spawn};
pub use session::{AgentAction, AgentEvent, AgentSession, AgentState, LinkFault, TimerKind};
