//! Rover-side link state machine.
//!
//! [`AgentSession`] is pure: it consumes [`AgentEvent`]s and returns the
//! [`AgentAction`]s the runtime must perform. It owns no socket and no
//! clock, so every transition can be driven directly in tests.
//!
//! ```text
//!             Start / reconnect tick           link opened
//! Disconnected ───────────────────▶ Connecting ───────────▶ Connected
//!      ▲                                 │                       │
//!      └──────── link failed ────────────┴──── link closed ──────┘
//!
//! any state ── Shutdown ──▶ ShuttingDown ── link closed ──▶ Stopped
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::bridge::RoverBridge;
use crate::protocol::{
    self, CommandPayload, CommandResponsePayload, CommandStatus, Envelope, LocalCommandPayload,
    MessageType, RegistrationAckPayload, TelemetryPayload,
};

/// Connection state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    /// No link; a reconnect may be scheduled.
    Disconnected,
    /// A link is being opened.
    Connecting,
    /// Link open and registration sent.
    Connected,
    /// Shutdown requested; waiting for the link to close.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Timers owned by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Periodic telemetry emission while connected.
    Telemetry,
    /// Periodic client `ping` while connected.
    Keepalive,
    /// Repeating reconnect attempt while disconnected.
    Reconnect,
}

/// Transport-level failure. Always recovered by the reconnect path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkFault {
    /// Opening the link failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Opening the link did not finish in time.
    #[error("connect timed out")]
    ConnectTimeout,
    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),
    /// Reading from the link failed.
    #[error("receive failed: {0}")]
    Receive(String),
    /// The server closed the link.
    #[error("closed by server")]
    ClosedByPeer,
    /// The agent closed the link.
    #[error("closed locally")]
    ClosedLocally,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Agent started.
    Start,
    /// The reconnect timer fired.
    ReconnectTick,
    /// The link finished opening.
    LinkOpened,
    /// The link could not be opened.
    LinkFailed(LinkFault),
    /// An open link errored or closed.
    LinkClosed(LinkFault),
    /// A text frame arrived.
    FrameReceived(String),
    /// The telemetry timer fired.
    TelemetryTick,
    /// The keepalive timer fired.
    KeepaliveTick,
    /// An operator issued a command on the rover itself.
    LocalCommand(String),
    /// External shutdown request.
    Shutdown,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    /// Open a link to the configured server.
    OpenLink,
    /// Write one envelope to the open link.
    Send(Envelope),
    /// Close the link, then report [`AgentEvent::LinkClosed`].
    CloseLink,
    /// Start a timer.
    StartTimer(TimerKind),
    /// Cancel a timer.
    StopTimer(TimerKind),
    /// The session reached [`AgentState::Stopped`]; the runtime may exit.
    Exit,
}

/// Client-role session state machine.
#[derive(Debug)]
pub struct AgentSession<B> {
    rover_id: String,
    state: AgentState,
    bridge: B,
    timers: BTreeSet<TimerKind>,
    rover_client_id: Option<i64>,
    last_pong: Option<DateTime<Utc>>,
}

impl<B: RoverBridge> AgentSession<B> {
    /// Creates a disconnected session for `rover_id`.
    #[must_use]
    pub fn new(rover_id: impl Into<String>, bridge: B) -> Self {
        Self {
            rover_id: rover_id.into(),
            state: AgentState::Disconnected,
            bridge,
            timers: BTreeSet::new(),
            rover_client_id: None,
            last_pong: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AgentState {
        self.state
    }

    /// This agent's rover identity.
    #[must_use]
    pub fn rover_id(&self) -> &str {
        &self.rover_id
    }

    /// Rover-client id assigned by the server for the current link.
    #[must_use]
    pub const fn rover_client_id(&self) -> Option<i64> {
        self.rover_client_id
    }

    /// Time of the last `pong` received on the current link.
    #[must_use]
    pub const fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.last_pong
    }

    /// Timers currently running.
    #[must_use]
    pub fn active_timers(&self) -> Vec<TimerKind> {
        self.timers.iter().copied().collect()
    }

    /// Shared access to the onboard bridge.
    #[must_use]
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// Applies one event and returns the actions to perform, in order.
    pub fn handle(&mut self, event: AgentEvent) -> Vec<AgentAction> {
        let mut actions = Vec::new();
        match event {
            AgentEvent::Start | AgentEvent::ReconnectTick => self.on_connect_attempt(&mut actions),
            AgentEvent::LinkOpened => self.on_link_opened(&mut actions),
            AgentEvent::LinkFailed(fault) | AgentEvent::LinkClosed(fault) => {
                self.on_link_down(&fault, &mut actions);
            }
            AgentEvent::FrameReceived(frame) => self.on_frame(&frame, &mut actions),
            AgentEvent::TelemetryTick => self.on_telemetry_tick(&mut actions),
            AgentEvent::KeepaliveTick => self.on_keepalive_tick(&mut actions),
            AgentEvent::LocalCommand(command) => self.on_local_command(&command, &mut actions),
            AgentEvent::Shutdown => self.on_shutdown(&mut actions),
        }
        actions
    }

    fn start_timer(&mut self, kind: TimerKind, actions: &mut Vec<AgentAction>) {
        if self.timers.insert(kind) {
            actions.push(AgentAction::StartTimer(kind));
        }
    }

    fn stop_timer(&mut self, kind: TimerKind, actions: &mut Vec<AgentAction>) {
        if self.timers.remove(&kind) {
            actions.push(AgentAction::StopTimer(kind));
        }
    }

    fn transition(&mut self, to: AgentState) {
        tracing::debug!(rover_id = %self.rover_id, from = %self.state, %to, "agent state change");
        self.state = to;
    }

    fn on_connect_attempt(&mut self, actions: &mut Vec<AgentAction>) {
        if self.state != AgentState::Disconnected {
            return;
        }
        self.transition(AgentState::Connecting);
        actions.push(AgentAction::OpenLink);
    }

    fn on_link_opened(&mut self, actions: &mut Vec<AgentAction>) {
        if self.state != AgentState::Connecting {
            actions.push(AgentAction::CloseLink);
            return;
        }
        self.transition(AgentState::Connected);
        tracing::info!(rover_id = %self.rover_id, "link open, registering");

        self.stop_timer(TimerKind::Reconnect, actions);
        actions.push(AgentAction::Send(Envelope::registration(&self.rover_id)));
        self.start_timer(TimerKind::Telemetry, actions);
        self.start_timer(TimerKind::Keepalive, actions);
    }

    fn on_link_down(&mut self, fault: &LinkFault, actions: &mut Vec<AgentAction>) {
        match self.state {
            AgentState::Connecting | AgentState::Connected => {
                tracing::warn!(rover_id = %self.rover_id, %fault, "link down, scheduling reconnect");
                self.transition(AgentState::Disconnected);
                self.rover_client_id = None;
                self.last_pong = None;
                self.stop_timer(TimerKind::Telemetry, actions);
                self.stop_timer(TimerKind::Keepalive, actions);
                self.start_timer(TimerKind::Reconnect, actions);
            }
            AgentState::ShuttingDown => {
                self.transition(AgentState::Stopped);
                actions.push(AgentAction::Exit);
            }
            AgentState::Disconnected | AgentState::Stopped => {}
        }
    }

    fn on_frame(&mut self, frame: &str, actions: &mut Vec<AgentAction>) {
        if self.state != AgentState::Connected {
            tracing::debug!(state = %self.state, "frame ignored outside connected state");
            return;
        }
        let envelope = match protocol::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(rover_id = %self.rover_id, error = %e, "dropping frame");
                return;
            }
        };

        match envelope.msg_type {
            MessageType::RegistrationAck => match envelope.payload_as::<RegistrationAckPayload>() {
                Ok(ack) => {
                    tracing::info!(
                        rover_id = %self.rover_id,
                        rover_client_id = ack.rover_client_id,
                        "registration acknowledged"
                    );
                    self.rover_client_id = Some(ack.rover_client_id);
                }
                Err(e) => tracing::warn!(error = %e, "dropping frame"),
            },
            MessageType::Command => match envelope.payload_as::<CommandPayload>() {
                Ok(cmd) => actions.push(AgentAction::Send(self.execute_command(&cmd))),
                Err(e) => tracing::warn!(error = %e, "dropping frame"),
            },
            MessageType::Ping => actions.push(AgentAction::Send(Envelope::pong())),
            MessageType::Pong => self.last_pong = Some(Utc::now()),
            MessageType::Disconnect => {
                tracing::info!(rover_id = %self.rover_id, "server announced disconnect");
            }
            MessageType::Registration
            | MessageType::Telemetry
            | MessageType::CommandResponse
            | MessageType::LocalCommand => {
                tracing::warn!(msg_type = %envelope.msg_type, "unexpected message from server");
            }
        }
    }

    fn execute_command(&mut self, cmd: &CommandPayload) -> Envelope {
        let (status, result) = match self.bridge.execute(&cmd.command) {
            Ok(result) => (CommandStatus::Completed, result),
            Err(fault) => {
                tracing::warn!(command_id = cmd.command_id, %fault, "command failed");
                (CommandStatus::Failed, fault.to_string())
            }
        };
        tracing::info!(command_id = cmd.command_id, command = %cmd.command, %status, "command handled");
        Envelope::new(
            MessageType::CommandResponse,
            &CommandResponsePayload {
                command_id: cmd.command_id,
                status,
                result,
                timestamp: Utc::now(),
            },
        )
    }

    fn on_telemetry_tick(&mut self, actions: &mut Vec<AgentAction>) {
        if self.state != AgentState::Connected {
            return;
        }
        let payload = TelemetryPayload {
            reading: self.bridge.read_telemetry(),
            timestamp: Some(Utc::now()),
        };
        actions.push(AgentAction::Send(Envelope::new(
            MessageType::Telemetry,
            &payload,
        )));
    }

    /// Pings the server. Until a `registration_ack` arrives on this link the
    /// registration is repeated on every tick as well.
    fn on_keepalive_tick(&self, actions: &mut Vec<AgentAction>) {
        if self.state != AgentState::Connected {
            return;
        }
        if self.rover_client_id.is_none() {
            tracing::warn!(rover_id = %self.rover_id, "no registration_ack yet, registering again");
            actions.push(AgentAction::Send(Envelope::registration(&self.rover_id)));
        }
        actions.push(AgentAction::Send(Envelope::ping()));
    }

    fn on_local_command(&mut self, command: &str, actions: &mut Vec<AgentAction>) {
        if matches!(self.state, AgentState::ShuttingDown | AgentState::Stopped) {
            return;
        }
        let (status, result) = match self.bridge.execute(command) {
            Ok(result) => (CommandStatus::Completed, result),
            Err(fault) => (CommandStatus::Failed, fault.to_string()),
        };
        if self.state != AgentState::Connected {
            tracing::info!(%command, %status, "local command executed while offline, not reported");
            return;
        }
        actions.push(AgentAction::Send(Envelope::new(
            MessageType::LocalCommand,
            &LocalCommandPayload {
                command: command.to_string(),
                status,
                result,
                timestamp: Utc::now(),
            },
        )));
    }

    fn on_shutdown(&mut self, actions: &mut Vec<AgentAction>) {
        let previous = self.state;
        if matches!(previous, AgentState::ShuttingDown | AgentState::Stopped) {
            return;
        }
        tracing::info!(rover_id = %self.rover_id, "shutting down");
        self.transition(AgentState::ShuttingDown);

        for kind in self.active_timers() {
            self.stop_timer(kind, actions);
        }
        match previous {
            AgentState::Connected => {
                actions.push(AgentAction::Send(Envelope::disconnect("shutdown")));
                actions.push(AgentAction::CloseLink);
            }
            AgentState::Connecting => actions.push(AgentAction::CloseLink),
            _ => {
                self.transition(AgentState::Stopped);
                actions.push(AgentAction::Exit);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::agent::bridge::SimulatedBridge;
    use crate::protocol::{RegistrationPayload, encode};

    fn session() -> AgentSession<SimulatedBridge> {
        AgentSession::new("R-001", SimulatedBridge::default())
    }

    fn connected() -> AgentSession<SimulatedBridge> {
        let mut s = session();
        let _ = s.handle(AgentEvent::Start);
        let _ = s.handle(AgentEvent::LinkOpened);
        assert_eq!(s.state(), AgentState::Connected);
        s
    }

    fn sent(actions: &[AgentAction]) -> Vec<&Envelope> {
        actions
            .iter()
            .filter_map(|a| match a {
                AgentAction::Send(env) => Some(env),
                _ => None,
            })
            .collect()
    }

    fn sent_types(actions: &[AgentAction]) -> Vec<MessageType> {
        sent(actions).iter().map(|e| e.msg_type).collect()
    }

    fn command_frame(id: u64, command: &str) -> String {
        encode(&Envelope::new(
            MessageType::Command,
            &CommandPayload {
                command_id: id,
                command: command.to_string(),
                timestamp: Utc::now(),
            },
        ))
    }

    fn only_response(actions: &[AgentAction]) -> CommandResponsePayload {
        let envelopes = sent(actions);
        let [env] = envelopes.as_slice() else {
            panic!("expected exactly one frame, got {}", envelopes.len());
        };
        assert_eq!(env.msg_type, MessageType::CommandResponse);
        let Ok(resp) = env.payload_as::<CommandResponsePayload>() else {
            panic!("response payload should parse");
        };
        resp
    }

    #[test]
    fn starts_disconnected_and_connects_on_start() {
        let mut s = session();
        assert_eq!(s.state(), AgentState::Disconnected);
        assert_eq!(s.handle(AgentEvent::Start), vec![AgentAction::OpenLink]);
        assert_eq!(s.state(), AgentState::Connecting);
    }

    #[test]
    fn link_open_registers_then_starts_timers() {
        let mut s = session();
        let _ = s.handle(AgentEvent::Start);
        let actions = s.handle(AgentEvent::LinkOpened);

        let [AgentAction::Send(reg), start_a, start_b] = actions.as_slice() else {
            panic!("unexpected actions: {actions:?}");
        };
        assert_eq!(reg.msg_type, MessageType::Registration);
        let Ok(payload) = reg.payload_as::<RegistrationPayload>() else {
            panic!("registration payload should parse");
        };
        assert_eq!(payload.rover_id, "R-001");
        assert_eq!(*start_a, AgentAction::StartTimer(TimerKind::Telemetry));
        assert_eq!(*start_b, AgentAction::StartTimer(TimerKind::Keepalive));
        assert_eq!(
            s.active_timers(),
            vec![TimerKind::Telemetry, TimerKind::Keepalive]
        );
    }

    #[test]
    fn connected_only_reachable_from_connecting() {
        let mut s = session();
        assert_eq!(s.handle(AgentEvent::LinkOpened), vec![AgentAction::CloseLink]);
        assert_eq!(s.state(), AgentState::Disconnected);

        let mut s = connected();
        let _ = s.handle(AgentEvent::LinkOpened);
        assert_eq!(s.state(), AgentState::Connected);
    }

    #[test]
    fn link_failure_schedules_reconnect_once() {
        let mut s = session();
        let _ = s.handle(AgentEvent::Start);
        let actions = s.handle(AgentEvent::LinkFailed(LinkFault::ConnectTimeout));
        assert_eq!(actions, vec![AgentAction::StartTimer(TimerKind::Reconnect)]);
        assert_eq!(s.state(), AgentState::Disconnected);

        // Tick re-attempts; the reconnect timer keeps running meanwhile.
        assert_eq!(s.handle(AgentEvent::ReconnectTick), vec![AgentAction::OpenLink]);
        let again = s.handle(AgentEvent::LinkFailed(LinkFault::Connect("refused".into())));
        assert!(again.is_empty(), "reconnect already scheduled: {again:?}");
        assert_eq!(s.active_timers(), vec![TimerKind::Reconnect]);
    }

    #[test]
    fn reconnect_cancelled_when_link_opens() {
        let mut s = session();
        let _ = s.handle(AgentEvent::Start);
        let _ = s.handle(AgentEvent::LinkFailed(LinkFault::ConnectTimeout));
        let _ = s.handle(AgentEvent::ReconnectTick);
        let actions = s.handle(AgentEvent::LinkOpened);
        assert_eq!(
            actions.first(),
            Some(&AgentAction::StopTimer(TimerKind::Reconnect))
        );
        assert!(!s.active_timers().contains(&TimerKind::Reconnect));
    }

    #[test]
    fn link_close_stops_session_timers() {
        let mut s = connected();
        let actions = s.handle(AgentEvent::LinkClosed(LinkFault::ClosedByPeer));
        assert_eq!(
            actions,
            vec![
                AgentAction::StopTimer(TimerKind::Telemetry),
                AgentAction::StopTimer(TimerKind::Keepalive),
                AgentAction::StartTimer(TimerKind::Reconnect),
            ]
        );
        assert_eq!(s.state(), AgentState::Disconnected);
    }

    #[test]
    fn reconnect_tick_while_connected_is_ignored() {
        let mut s = connected();
        assert!(s.handle(AgentEvent::ReconnectTick).is_empty());
        assert_eq!(s.state(), AgentState::Connected);
    }

    #[test]
    fn unacknowledged_registration_is_repeated_on_keepalive() {
        let mut s = connected();
        assert_eq!(
            sent_types(&s.handle(AgentEvent::KeepaliveTick)),
            vec![MessageType::Registration, MessageType::Ping]
        );
        assert_eq!(
            sent_types(&s.handle(AgentEvent::KeepaliveTick)),
            vec![MessageType::Registration, MessageType::Ping]
        );

        let _ = s.handle(AgentEvent::FrameReceived(encode(&Envelope::registration_ack(3))));
        assert_eq!(
            sent_types(&s.handle(AgentEvent::KeepaliveTick)),
            vec![MessageType::Ping]
        );
    }

    #[test]
    fn registration_ack_records_client_id() {
        let mut s = connected();
        let frame = encode(&Envelope::registration_ack(7));
        assert!(s.handle(AgentEvent::FrameReceived(frame)).is_empty());
        assert_eq!(s.rover_client_id(), Some(7));
        assert_eq!(s.state(), AgentState::Connected);
    }

    #[test]
    fn command_yields_completed_response() {
        let mut s = connected();
        let actions = s.handle(AgentEvent::FrameReceived(command_frame(4, "move_forward")));
        let resp = only_response(&actions);
        assert_eq!(resp.command_id, 4);
        assert_eq!(resp.status, CommandStatus::Completed);
        assert!(resp.result.contains("forward"));
    }

    #[test]
    fn rejected_command_yields_failed_response() {
        let mut s = connected();
        let actions = s.handle(AgentEvent::FrameReceived(command_frame(5, "fly")));
        let resp = only_response(&actions);
        assert_eq!(resp.command_id, 5);
        assert_eq!(resp.status, CommandStatus::Failed);
        assert_eq!(s.state(), AgentState::Connected);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let mut s = connected();
        let actions = s.handle(AgentEvent::FrameReceived(encode(&Envelope::ping())));
        assert_eq!(sent_types(&actions), vec![MessageType::Pong]);
    }

    #[test]
    fn pong_is_recorded() {
        let mut s = connected();
        assert!(s.last_pong().is_none());
        let _ = s.handle(AgentEvent::FrameReceived(encode(&Envelope::pong())));
        assert!(s.last_pong().is_some());
    }

    #[test]
    fn malformed_frame_changes_nothing() {
        let mut s = connected();
        let timers = s.active_timers();
        for frame in ["{", r#"{"type":"warp","payload":{}}"#, r#"{"type":"command","payload":{}}"#] {
            assert!(s.handle(AgentEvent::FrameReceived(frame.to_string())).is_empty());
            assert_eq!(s.state(), AgentState::Connected);
            assert_eq!(s.active_timers(), timers);
        }
    }

    #[test]
    fn telemetry_only_sent_while_connected() {
        let mut s = session();
        assert!(s.handle(AgentEvent::TelemetryTick).is_empty());
        let _ = s.handle(AgentEvent::Start);
        assert!(s.handle(AgentEvent::TelemetryTick).is_empty());

        let mut s = connected();
        let actions = s.handle(AgentEvent::TelemetryTick);
        assert_eq!(sent_types(&actions), vec![MessageType::Telemetry]);

        let _ = s.handle(AgentEvent::LinkClosed(LinkFault::ClosedByPeer));
        assert!(s.handle(AgentEvent::TelemetryTick).is_empty());
        assert!(s.handle(AgentEvent::KeepaliveTick).is_empty());
    }

    #[test]
    fn local_command_is_reported_only_when_connected() {
        let mut s = session();
        assert!(s.handle(AgentEvent::LocalCommand("stop".into())).is_empty());

        let mut s = connected();
        let actions = s.handle(AgentEvent::LocalCommand("turn_left".into()));
        let envelopes = sent(&actions);
        let [env] = envelopes.as_slice() else {
            panic!("expected one local_command frame");
        };
        let Ok(payload) = env.payload_as::<LocalCommandPayload>() else {
            panic!("local_command payload should parse");
        };
        assert_eq!(payload.command, "turn_left");
        assert_eq!(payload.status, CommandStatus::Completed);
    }

    #[test]
    fn shutdown_while_connected_sends_disconnect_and_closes() {
        let mut s = connected();
        let actions = s.handle(AgentEvent::Shutdown);
        assert_eq!(s.state(), AgentState::ShuttingDown);
        assert!(actions.contains(&AgentAction::StopTimer(TimerKind::Telemetry)));
        assert!(actions.contains(&AgentAction::StopTimer(TimerKind::Keepalive)));
        assert_eq!(sent_types(&actions), vec![MessageType::Disconnect]);
        assert_eq!(actions.last(), Some(&AgentAction::CloseLink));
        assert!(s.active_timers().is_empty());

        let closed = s.handle(AgentEvent::LinkClosed(LinkFault::ClosedLocally));
        assert_eq!(closed, vec![AgentAction::Exit]);
        assert_eq!(s.state(), AgentState::Stopped);
        assert!(s.handle(AgentEvent::Start).is_empty());
    }

    #[test]
    fn shutdown_while_disconnected_stops_immediately() {
        let mut s = session();
        let _ = s.handle(AgentEvent::Start);
        let _ = s.handle(AgentEvent::LinkFailed(LinkFault::ConnectTimeout));
        let actions = s.handle(AgentEvent::Shutdown);
        assert_eq!(
            actions,
            vec![AgentAction::StopTimer(TimerKind::Reconnect), AgentAction::Exit]
        );
        assert_eq!(s.state(), AgentState::Stopped);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut s = connected();
        let _ = s.handle(AgentEvent::Shutdown);
        assert!(s.handle(AgentEvent::Shutdown).is_empty());
        let _ = s.handle(AgentEvent::LinkClosed(LinkFault::ClosedLocally));
        assert!(s.handle(AgentEvent::Shutdown).is_empty());
        assert_eq!(s.state(), AgentState::Stopped);
    }

    #[test]
    fn arbitrary_event_sequences_stay_consistent() {
        let script = [
            AgentEvent::LinkOpened,
            AgentEvent::Start,
            AgentEvent::LinkFailed(LinkFault::ConnectTimeout),
            AgentEvent::TelemetryTick,
            AgentEvent::ReconnectTick,
            AgentEvent::ReconnectTick,
            AgentEvent::LinkOpened,
            AgentEvent::LinkOpened,
            AgentEvent::LinkClosed(LinkFault::ClosedByPeer),
            AgentEvent::LinkClosed(LinkFault::ClosedByPeer),
            AgentEvent::ReconnectTick,
            AgentEvent::LinkOpened,
        ];
        let mut s = session();
        let mut previous = s.state();
        for event in script {
            let _ = s.handle(event);
            let now = s.state();
            if now == AgentState::Connected && previous != AgentState::Connected {
                assert_eq!(previous, AgentState::Connecting);
            }
            let timers = s.active_timers();
            let streaming = timers.contains(&TimerKind::Telemetry);
            assert_eq!(streaming, now == AgentState::Connected);
            assert_eq!(streaming, timers.contains(&TimerKind::Keepalive));
            if now == AgentState::Connected {
                assert!(!timers.contains(&TimerKind::Reconnect));
            }
            previous = now;
        }
        assert_eq!(s.state(), AgentState::Connected);
    }

    /// Drives the session with a virtual clock: each active timer fires at
    /// its own period, starting one period after it was started.
    fn run_for(
        s: &mut AgentSession<SimulatedBridge>,
        periods: &BTreeMap<TimerKind, u64>,
        total_ms: u64,
    ) -> Vec<MessageType> {
        let mut due: BTreeMap<TimerKind, u64> = BTreeMap::new();
        let mut sent_log = Vec::new();
        for now in 0..=total_ms {
            for kind in s.active_timers() {
                let period = periods.get(&kind).copied().unwrap_or(u64::MAX);
                let next = *due.entry(kind).or_insert(now.saturating_add(period));
                if next == now {
                    due.insert(kind, now.saturating_add(period));
                    let event = match kind {
                        TimerKind::Telemetry => AgentEvent::TelemetryTick,
                        TimerKind::Keepalive => AgentEvent::KeepaliveTick,
                        TimerKind::Reconnect => AgentEvent::ReconnectTick,
                    };
                    sent_log.extend(sent_types(&s.handle(event)));
                }
            }
            due.retain(|kind, _| s.active_timers().contains(kind));
        }
        sent_log
    }

    #[test]
    fn registered_agent_streams_telemetry_and_pings_within_keepalive() {
        let mut s = session();
        let _ = s.handle(AgentEvent::Start);
        let opened = s.handle(AgentEvent::LinkOpened);
        assert_eq!(sent_types(&opened), vec![MessageType::Registration]);
        let _ = s.handle(AgentEvent::FrameReceived(encode(&Envelope::registration_ack(7))));
        assert_eq!(s.rover_client_id(), Some(7));

        let periods = BTreeMap::from([
            (TimerKind::Telemetry, 2_000),
            (TimerKind::Keepalive, 30_000),
            (TimerKind::Reconnect, 5_000),
        ]);
        let log = run_for(&mut s, &periods, 30_000);
        let telemetry = log.iter().filter(|t| **t == MessageType::Telemetry).count();
        let pings = log.iter().filter(|t| **t == MessageType::Ping).count();
        assert_eq!(telemetry, 15);
        assert!(pings >= 1);
    }
}
