//! Tokio driver for [`AgentSession`].
//!
//! Owns the WebSocket, the three timers and the shutdown signal. Every
//! wake-up becomes an [`AgentEvent`]; every returned [`AgentAction`] is
//! performed here before the next wake-up is awaited.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::bridge::RoverBridge;
use super::session::{AgentAction, AgentEvent, AgentSession, AgentState, LinkFault, TimerKind};
use crate::config::AgentConfig;
use crate::protocol::encode;

/// Upper bound on a single connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const LOCAL_COMMAND_QUEUE: usize = 32;

type Link = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Snapshot of the agent published after every processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStatus {
    /// Current session state.
    pub state: AgentState,
    /// Id assigned by the server on the current link, if acknowledged.
    pub rover_client_id: Option<i64>,
}

/// Control handle for a spawned agent.
///
/// Dropping the handle requests shutdown.
#[derive(Debug)]
pub struct AgentHandle {
    shutdown: watch::Sender<bool>,
    local: mpsc::Sender<String>,
    status: watch::Receiver<AgentStatus>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    /// Requests a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Queues a command typed on the rover itself.
    ///
    /// Returns `false` if the agent has already stopped.
    pub async fn local_command(&self, command: impl Into<String>) -> bool {
        self.local.send(command.into()).await.is_ok()
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status.clone()
    }

    /// Waits for the agent task to finish.
    ///
    /// # Errors
    ///
    /// Returns the [`tokio::task::JoinError`] if the task panicked or was
    /// aborted.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        let Self { task, shutdown, .. } = self;
        let result = task.await;
        drop(shutdown);
        result
    }
}

/// Spawns an agent on the current tokio runtime and starts connecting.
pub fn spawn<B>(config: AgentConfig, bridge: B) -> AgentHandle
where
    B: RoverBridge + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (local_tx, local_rx) = mpsc::channel(LOCAL_COMMAND_QUEUE);
    let session = AgentSession::new(config.rover_id.clone(), bridge);
    let (status_tx, status_rx) = watch::channel(AgentStatus {
        state: session.state(),
        rover_client_id: None,
    });

    let runtime = Runtime {
        config,
        session,
        link: None,
        telemetry: None,
        keepalive: None,
        reconnect: None,
        shutdown: Some(shutdown_rx),
        local: Some(local_rx),
        status: status_tx,
        pending: VecDeque::new(),
    };
    let task = tokio::spawn(runtime.run());

    AgentHandle {
        shutdown: shutdown_tx,
        local: local_tx,
        status: status_rx,
        task,
    }
}

enum Wake {
    Shutdown,
    Timer(TimerKind),
    Frame(Option<Result<Message, tungstenite::Error>>),
    Local(Option<String>),
}

struct Runtime<B> {
    config: AgentConfig,
    session: AgentSession<B>,
    link: Option<Link>,
    telemetry: Option<Interval>,
    keepalive: Option<Interval>,
    reconnect: Option<Interval>,
    shutdown: Option<watch::Receiver<bool>>,
    local: Option<mpsc::Receiver<String>>,
    status: watch::Sender<AgentStatus>,
    pending: VecDeque<AgentEvent>,
}

impl<B: RoverBridge> Runtime<B> {
    async fn run(mut self) {
        tracing::info!(
            rover_id = %self.config.rover_id,
            server_url = %self.config.server_url,
            "rover agent starting"
        );
        self.pending.push_back(AgentEvent::Start);

        loop {
            while let Some(event) = self.pending.pop_front() {
                for action in self.session.handle(event) {
                    self.perform(action).await;
                }
                self.publish();
            }
            if self.session.state() == AgentState::Stopped {
                break;
            }
            if let Some(event) = self.wait().await {
                self.pending.push_back(event);
            }
        }

        tracing::info!(rover_id = %self.config.rover_id, "rover agent stopped");
    }

    fn publish(&self) {
        let status = AgentStatus {
            state: self.session.state(),
            rover_client_id: self.session.rover_client_id(),
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    async fn wait(&mut self) -> Option<AgentEvent> {
        let Self {
            link,
            telemetry,
            keepalive,
            reconnect,
            shutdown,
            local,
            ..
        } = self;

        let wake = tokio::select! {
            () = shutdown_requested(shutdown) => Wake::Shutdown,
            () = tick(telemetry) => Wake::Timer(TimerKind::Telemetry),
            () = tick(keepalive) => Wake::Timer(TimerKind::Keepalive),
            () = tick(reconnect) => Wake::Timer(TimerKind::Reconnect),
            frame = next_frame(link) => Wake::Frame(frame),
            command = next_local(local) => Wake::Local(command),
        };

        match wake {
            Wake::Shutdown => {
                self.shutdown = None;
                Some(AgentEvent::Shutdown)
            }
            Wake::Timer(TimerKind::Telemetry) => Some(AgentEvent::TelemetryTick),
            Wake::Timer(TimerKind::Keepalive) => Some(AgentEvent::KeepaliveTick),
            Wake::Timer(TimerKind::Reconnect) => Some(AgentEvent::ReconnectTick),
            Wake::Frame(Some(Ok(Message::Text(text)))) => {
                Some(AgentEvent::FrameReceived(text.as_str().to_owned()))
            }
            Wake::Frame(Some(Ok(Message::Close(_))) | None) => {
                self.link = None;
                Some(AgentEvent::LinkClosed(LinkFault::ClosedByPeer))
            }
            Wake::Frame(Some(Err(e))) => {
                self.link = None;
                Some(AgentEvent::LinkClosed(LinkFault::Receive(e.to_string())))
            }
            Wake::Frame(Some(Ok(_))) => None,
            Wake::Local(Some(command)) => Some(AgentEvent::LocalCommand(command)),
            Wake::Local(None) => {
                self.local = None;
                None
            }
        }
    }

    async fn perform(&mut self, action: AgentAction) {
        match action {
            AgentAction::OpenLink => self.open_link().await,
            AgentAction::Send(envelope) => {
                let Some(link) = self.link.as_mut() else {
                    tracing::debug!(msg_type = %envelope.msg_type, "no link, frame dropped");
                    return;
                };
                if let Err(e) = link.send(Message::text(encode(&envelope))).await {
                    self.link = None;
                    self.pending
                        .push_back(AgentEvent::LinkClosed(LinkFault::Send(e.to_string())));
                }
            }
            AgentAction::CloseLink => {
                if let Some(mut link) = self.link.take()
                    && let Err(e) = link.close(None).await
                {
                    tracing::debug!(error = %e, "close handshake failed");
                }
                self.pending
                    .push_back(AgentEvent::LinkClosed(LinkFault::ClosedLocally));
            }
            AgentAction::StartTimer(kind) => {
                let period = self.period(kind);
                let mut timer = tokio::time::interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *self.timer_slot(kind) = Some(timer);
            }
            AgentAction::StopTimer(kind) => *self.timer_slot(kind) = None,
            AgentAction::Exit => {
                self.link = None;
                self.pending.clear();
            }
        }
    }

    async fn open_link(&mut self) {
        tracing::debug!(server_url = %self.config.server_url, "connecting");
        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.config.server_url.clone()),
        );

        let outcome = tokio::select! {
            result = connect => Some(result),
            () = shutdown_requested(&mut self.shutdown) => None,
        };

        let event = match outcome {
            None => {
                self.shutdown = None;
                AgentEvent::Shutdown
            }
            Some(Ok(Ok((link, _response)))) => {
                tracing::info!(server_url = %self.config.server_url, "connected");
                self.link = Some(link);
                AgentEvent::LinkOpened
            }
            Some(Ok(Err(e))) => AgentEvent::LinkFailed(LinkFault::Connect(e.to_string())),
            Some(Err(_elapsed)) => AgentEvent::LinkFailed(LinkFault::ConnectTimeout),
        };
        self.pending.push_back(event);
    }

    const fn period(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Telemetry => self.config.telemetry_interval,
            TimerKind::Keepalive => self.config.keepalive_interval,
            TimerKind::Reconnect => self.config.reconnect_interval,
        }
    }

    fn timer_slot(&mut self, kind: TimerKind) -> &mut Option<Interval> {
        match kind {
            TimerKind::Telemetry => &mut self.telemetry,
            TimerKind::Keepalive => &mut self.keepalive,
            TimerKind::Reconnect => &mut self.reconnect,
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<Result<Message, tungstenite::Error>> {
    match link {
        Some(link) => link.next().await,
        None => std::future::pending().await,
    }
}

async fn next_local(local: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match local {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves once shutdown is requested or every sender is gone.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.wait_for(|requested| *requested).await;
        }
        None => std::future::pending().await,
    }
}
