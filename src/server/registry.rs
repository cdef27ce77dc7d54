//! Server-side session registry.
//!
//! Owns every accepted link, binds links to rover identities on
//! registration, dispatches commands and correlates their responses.
//!
//! # Concurrency
//!
//! All in-memory state sits behind one [`RwLock`]. The lock is never held
//! across a storage call; operations read what they need, release the
//! lock, persist, then re-acquire it to publish the result.
//!
//! # Storage failures
//!
//! Storage errors are returned to the caller. Protocol state (bindings,
//! pending commands, liveness) is updated regardless and links are never
//! closed because persistence failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use super::link::{LinkHandle, LinkId};
use crate::error::ServerError;
use crate::protocol::{
    self, CommandPayload, CommandResponsePayload, CommandStatus, DisconnectPayload, Envelope,
    LocalCommandPayload, MessageType, RegistrationPayload, TelemetryPayload,
};
use crate::storage::{
    CommandLog, CommandLogUpdate, CommandOrigin, NewCommandLog, NewRover, NewRoverSession,
    NewTelemetrySample, Rover, RoverSession, RoverUpdate, SessionUpdate, Storage, StorageError,
    TelemetrySample,
};

/// Failure reason recorded for commands pending on a superseded session.
pub const SESSION_SUPERSEDED: &str = "session_superseded";
/// Failure reason recorded for commands pending when a link closes.
pub const SESSION_CLOSED: &str = "session_closed";
/// Failure reason recorded when a command could not be queued on its link.
pub const LINK_UNAVAILABLE: &str = "link_unavailable";

/// A command sent to a rover and not yet resolved.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PendingCommand {
    /// Identifier unique within the owning session.
    pub command_id: u64,
    /// Rover the command was sent to.
    pub rover_identifier: String,
    /// Command text.
    pub command: String,
    /// `pending` until the rover answers.
    pub status: CommandStatus,
    /// Result text reported by the rover.
    pub result: Option<String>,
    /// Server time of dispatch.
    pub dispatched_at: DateTime<Utc>,
    /// Id of the persisted command log row.
    pub log_id: i64,
}

/// Snapshot of one live, registered session.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SessionInfo {
    /// Link carrying the session.
    #[schema(value_type = String, format = Uuid)]
    pub link_id: LinkId,
    /// Rover identity.
    pub identifier: String,
    /// Storage id of the rover.
    pub rover_id: i64,
    /// Rover-client id sent in `registration_ack`.
    pub rover_client_id: i64,
    /// Peer address of the link.
    pub remote_addr: Option<String>,
    /// Registration time.
    pub connected_at: DateTime<Utc>,
    /// Last `ping`/`pong` seen.
    pub last_ping: DateTime<Utc>,
    /// Commands awaiting a response.
    pub pending_commands: usize,
}

#[derive(Debug, Clone)]
struct Binding {
    identifier: String,
    rover_id: i64,
    rover_client_id: i64,
    connected_at: DateTime<Utc>,
    last_ping: DateTime<Utc>,
}

#[derive(Debug)]
struct LinkEntry {
    handle: LinkHandle,
    opened_at: DateTime<Utc>,
    /// Identity this link registered as, set before any storage write.
    claim: Option<String>,
    binding: Option<Binding>,
    superseded: bool,
    next_command_id: u64,
    pending: HashMap<u64, PendingCommand>,
}

impl LinkEntry {
    fn new(handle: LinkHandle) -> Self {
        Self {
            handle,
            opened_at: Utc::now(),
            claim: None,
            binding: None,
            superseded: false,
            next_command_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Binding that still routes traffic: registered and not superseded.
    fn active_binding(&self) -> Option<&Binding> {
        if self.superseded {
            None
        } else {
            self.binding.as_ref()
        }
    }
}

/// Where a registration ended up once its records were stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Published {
    Active,
    Superseded,
    Closed { vacant: bool },
}

#[derive(Debug, Default)]
struct Links {
    by_id: HashMap<LinkId, LinkEntry>,
    /// Rover identity -> the link currently carrying its session.
    active: HashMap<String, LinkId>,
}

/// Registry of all server-side links and rover sessions.
#[derive(Debug)]
pub struct SessionRegistry {
    storage: Arc<dyn Storage>,
    links: RwLock<Links>,
}

impl SessionRegistry {
    /// Creates an empty registry persisting through `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            links: RwLock::new(Links::default()),
        }
    }

    /// The storage this registry writes to.
    #[must_use]
    pub const fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Registers a freshly accepted, not yet bound link.
    pub async fn on_link_open(&self, handle: LinkHandle) {
        let link_id = handle.id();
        tracing::info!(%link_id, remote_addr = ?handle.remote_addr(), "link opened");
        self.links
            .write()
            .await
            .by_id
            .insert(link_id, LinkEntry::new(handle));
    }

    /// Binds `link` to the rover identity in `registration`.
    ///
    /// The identity is claimed for `link` before anything is written, so a
    /// close of the link it replaces no longer counts as the rover going
    /// offline. Any prior session of the same identity is superseded: its
    /// link stays open, its pending commands fail with
    /// [`SESSION_SUPERSEDED`] and its frames other than `ping`/`pong` are
    /// ignored from now on.
    ///
    /// Returns the rover-client id sent back in `registration_ack`.
    ///
    /// # Errors
    ///
    /// - [`ServerError::InvalidRequest`] for an empty identity or a link
    ///   already claimed by another identity.
    /// - [`ServerError::LinkNotRegistered`] for an unknown link, or one that
    ///   closed while its registration was being stored.
    /// - [`ServerError::Storage`] if the rover or session record could not
    ///   be written; the claim is then released and the link stays unbound
    ///   until the rover registers again.
    pub async fn on_registration(
        &self,
        link: LinkId,
        registration: &RegistrationPayload,
    ) -> Result<i64, ServerError> {
        let identifier = registration.rover_id.trim();
        if identifier.is_empty() {
            return Err(ServerError::InvalidRequest(
                "rover_id must not be empty".to_string(),
            ));
        }

        let (handle, superseded) = self.claim(link, identifier).await?;
        if let Some(pending) = superseded {
            tracing::info!(
                rover_id = identifier,
                %link,
                failed_commands = pending.len(),
                "prior session superseded"
            );
            if let Err(e) = self
                .fail_commands(pending.into_values().collect(), SESSION_SUPERSEDED)
                .await
            {
                tracing::warn!(rover_id = identifier, error = %e, "failed to close out superseded commands");
            }
        }

        let now = Utc::now();
        let address = handle.remote_addr().map(|addr| addr.to_string());
        let rover = match self.upsert_rover(identifier, address, now).await {
            Ok(rover) => rover,
            Err(e) => {
                self.release_claim(link, identifier, None).await;
                return Err(e);
            }
        };
        let session = match self.upsert_session(&rover, now).await {
            Ok(session) => session,
            Err(e) => {
                self.release_claim(link, identifier, Some(&rover)).await;
                return Err(e);
            }
        };

        self.publish_binding(link, &handle, &rover, &session, now)
            .await
    }

    /// Points `identifier` at `link` and supersedes whichever link held it.
    ///
    /// Returns the link's handle and the pending commands taken from the
    /// superseded link, if any.
    async fn claim(
        &self,
        link: LinkId,
        identifier: &str,
    ) -> Result<(LinkHandle, Option<HashMap<u64, PendingCommand>>), ServerError> {
        let mut guard = self.links.write().await;
        let links = &mut *guard;
        let entry = links
            .by_id
            .get_mut(&link)
            .ok_or_else(|| ServerError::LinkNotRegistered(link.to_string()))?;
        if let Some(claimed) = &entry.claim
            && claimed != identifier
        {
            return Err(ServerError::InvalidRequest(format!(
                "link already registered as {claimed}"
            )));
        }
        entry.claim = Some(identifier.to_string());
        entry.superseded = false;
        let handle = entry.handle.clone();

        let superseded = match links.active.insert(identifier.to_string(), link) {
            Some(previous) if previous != link => links.by_id.get_mut(&previous).map(|old| {
                old.superseded = true;
                std::mem::take(&mut old.pending)
            }),
            _ => None,
        };
        Ok((handle, superseded))
    }

    /// Undoes a claim after a failed registration.
    ///
    /// A link that was already bound keeps its binding. Otherwise the
    /// identity is freed if `link` still holds it, and a rover record
    /// already flagged connected is flagged disconnected again unless
    /// another link has taken the identity over.
    async fn release_claim(&self, link: LinkId, identifier: &str, written: Option<&Rover>) {
        let vacated = {
            let mut guard = self.links.write().await;
            let links = &mut *guard;
            let bound = match links.by_id.get_mut(&link) {
                Some(entry) if entry.binding.is_some() => true,
                Some(entry) => {
                    entry.claim = None;
                    false
                }
                None => false,
            };
            let holder = links.active.get(identifier).copied();
            match holder {
                _ if bound => false,
                Some(holder) if holder == link => {
                    links.active.remove(identifier);
                    true
                }
                Some(_) => false,
                None => true,
            }
        };
        tracing::warn!(rover_id = identifier, %link, "registration not stored, link left unbound");

        if vacated && let Some(rover) = written {
            let update = RoverUpdate {
                is_connected: Some(false),
                ..RoverUpdate::default()
            };
            if let Err(e) = self.storage.update_rover(rover.id, update).await {
                tracing::warn!(rover_id = identifier, error = %e, "failed to reset rover connectivity");
            }
        }
    }

    /// Binds `link` once its records are stored and acknowledges it.
    ///
    /// A link superseded while its records were being written is bound
    /// but not acknowledged. A link that closed meanwhile gets its records
    /// flagged disconnected again.
    async fn publish_binding(
        &self,
        link: LinkId,
        handle: &LinkHandle,
        rover: &Rover,
        session: &RoverSession,
        now: DateTime<Utc>,
    ) -> Result<i64, ServerError> {
        let identifier = rover.identifier.as_str();
        let published = {
            let mut guard = self.links.write().await;
            let links = &mut *guard;
            match links.by_id.get_mut(&link) {
                Some(entry) => {
                    entry.binding = Some(Binding {
                        identifier: identifier.to_string(),
                        rover_id: rover.id,
                        rover_client_id: session.id,
                        connected_at: now,
                        last_ping: now,
                    });
                    if entry.superseded {
                        Published::Superseded
                    } else {
                        Published::Active
                    }
                }
                None => Published::Closed {
                    vacant: !links.active.contains_key(identifier),
                },
            }
        };

        match published {
            Published::Active => {
                tracing::info!(
                    rover_id = identifier,
                    %link,
                    rover_client_id = session.id,
                    "rover registered"
                );
                if let Err(e) = handle.send(Envelope::registration_ack(session.id)) {
                    tracing::warn!(%link, error = %e, "registration_ack not queued");
                }
                Ok(session.id)
            }
            Published::Superseded => {
                tracing::info!(rover_id = identifier, %link, "superseded during registration, no ack sent");
                Ok(session.id)
            }
            Published::Closed { vacant } => {
                tracing::info!(rover_id = identifier, %link, "link closed during registration");
                if vacant {
                    self.mark_offline(rover.id, session.id).await?;
                }
                Err(ServerError::LinkNotRegistered(link.to_string()))
            }
        }
    }

    /// Flags the rover and session records disconnected.
    ///
    /// Both updates are attempted; the first error is returned.
    async fn mark_offline(&self, rover_id: i64, session_id: i64) -> Result<(), ServerError> {
        let rover_update = RoverUpdate {
            is_connected: Some(false),
            last_seen: Some(Utc::now()),
            ..RoverUpdate::default()
        };
        let session_update = SessionUpdate {
            is_connected: Some(false),
            ..SessionUpdate::default()
        };
        let rover = self.storage.update_rover(rover_id, rover_update).await;
        let session = self.storage.update_session(session_id, session_update).await;
        rover.map(drop).and(session.map(drop)).map_err(ServerError::from)
    }

    async fn upsert_rover(
        &self,
        identifier: &str,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Rover, ServerError> {
        let existing = match self.storage.get_rover_by_identifier(identifier).await? {
            Some(rover) => rover,
            None => {
                let new = NewRover {
                    identifier: identifier.to_string(),
                    name: identifier.to_string(),
                    address: address.clone(),
                    is_connected: true,
                    metadata: serde_json::json!({}),
                };
                match self.storage.create_rover(new).await {
                    Ok(rover) => rover,
                    Err(StorageError::Conflict(_)) => self
                        .storage
                        .get_rover_by_identifier(identifier)
                        .await?
                        .ok_or_else(|| ServerError::RoverNotFound(identifier.to_string()))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let update = RoverUpdate {
            address,
            is_connected: Some(true),
            last_seen: Some(now),
            ..RoverUpdate::default()
        };
        Ok(self.storage.update_rover(existing.id, update).await?)
    }

    async fn upsert_session(
        &self,
        rover: &Rover,
        now: DateTime<Utc>,
    ) -> Result<RoverSession, ServerError> {
        let existing = match self
            .storage
            .get_session_by_identifier(&rover.identifier)
            .await?
        {
            Some(existing) => existing,
            None => {
                let new = NewRoverSession {
                    rover_id: rover.id,
                    identifier: rover.identifier.clone(),
                    is_connected: true,
                    last_ping: now,
                };
                match self.storage.create_session(new).await {
                    Ok(session) => return Ok(session),
                    Err(StorageError::Conflict(_)) => self
                        .storage
                        .get_session_by_identifier(&rover.identifier)
                        .await?
                        .ok_or_else(|| ServerError::RoverNotFound(rover.identifier.clone()))?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let update = SessionUpdate {
            is_connected: Some(true),
            last_ping: Some(now),
        };
        Ok(self.storage.update_session(existing.id, update).await?)
    }

    /// Records liveness for `link` and returns its handle plus the
    /// rover-client id of its active session, if any.
    async fn touch(&self, link: LinkId, now: DateTime<Utc>) -> Option<(LinkHandle, Option<i64>)> {
        let mut links = self.links.write().await;
        let entry = links.by_id.get_mut(&link)?;
        let session = match entry.binding.as_mut() {
            Some(binding) if !entry.superseded => {
                binding.last_ping = now;
                Some(binding.rover_client_id)
            }
            _ => None,
        };
        Some((entry.handle.clone(), session))
    }

    async fn persist_ping(&self, session: Option<i64>, now: DateTime<Utc>) -> Result<(), ServerError> {
        if let Some(id) = session {
            let update = SessionUpdate {
                last_ping: Some(now),
                ..SessionUpdate::default()
            };
            self.storage.update_session(id, update).await?;
        }
        Ok(())
    }

    /// Answers a `ping` with `pong` and refreshes liveness.
    ///
    /// Superseded and unregistered links are answered but not tracked.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Storage`] if the session record could not be
    /// updated.
    pub async fn on_ping(&self, link: LinkId) -> Result<(), ServerError> {
        let now = Utc::now();
        let Some((handle, session)) = self.touch(link, now).await else {
            return Ok(());
        };
        if let Err(e) = handle.send(Envelope::pong()) {
            tracing::warn!(%link, error = %e, "pong not queued");
        }
        self.persist_ping(session, now).await
    }

    /// Refreshes liveness on a `pong`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Storage`] if the session record could not be
    /// updated.
    pub async fn on_pong(&self, link: LinkId) -> Result<(), ServerError> {
        let now = Utc::now();
        let Some((_, session)) = self.touch(link, now).await else {
            return Ok(());
        };
        self.persist_ping(session, now).await
    }

    async fn active_binding(&self, link: LinkId) -> Option<Binding> {
        let links = self.links.read().await;
        links.by_id.get(&link)?.active_binding().cloned()
    }

    /// Persists one telemetry sample stamped with the receipt time.
    ///
    /// Samples from links without an active session are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Storage`] if the sample or the rover's
    /// last-seen update could not be written.
    pub async fn on_telemetry(
        &self,
        link: LinkId,
        telemetry: TelemetryPayload,
    ) -> Result<Option<TelemetrySample>, ServerError> {
        let Some(binding) = self.active_binding(link).await else {
            tracing::warn!(%link, "telemetry from unregistered link dropped");
            return Ok(None);
        };

        let now = Utc::now();
        let battery_level = telemetry.reading.battery_level;
        let sample = self
            .storage
            .create_telemetry(NewTelemetrySample {
                rover_id: binding.rover_id,
                reading: telemetry.reading,
                recorded_at: now,
            })
            .await?;

        let update = RoverUpdate {
            battery_level,
            last_seen: Some(now),
            ..RoverUpdate::default()
        };
        self.storage.update_rover(binding.rover_id, update).await?;
        Ok(Some(sample))
    }

    /// Sends `command` to the rover's active session and returns at once.
    ///
    /// The command is logged as `pending`; the rover's `command_response`
    /// resolves it later through [`Self::on_command_response`].
    ///
    /// # Errors
    ///
    /// - [`ServerError::InvalidRequest`] for empty command text.
    /// - [`ServerError::NoActiveSession`] if the rover has no live link or
    ///   the command could not be queued on it.
    /// - [`ServerError::Storage`] if the command log row could not be
    ///   created; nothing is sent in that case.
    pub async fn dispatch_command(
        &self,
        identifier: &str,
        command: &str,
    ) -> Result<PendingCommand, ServerError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ServerError::InvalidRequest(
                "command must not be empty".to_string(),
            ));
        }
        let no_session = || ServerError::NoActiveSession(identifier.to_string());

        let (link, handle, binding, command_id) = {
            let mut guard = self.links.write().await;
            let links = &mut *guard;
            let link = *links.active.get(identifier).ok_or_else(no_session)?;
            let entry = links.by_id.get_mut(&link).ok_or_else(no_session)?;
            let binding = entry.active_binding().cloned().ok_or_else(no_session)?;
            entry.next_command_id = entry
                .next_command_id
                .checked_add(1)
                .ok_or_else(|| ServerError::Internal("command ids exhausted".to_string()))?;
            (link, entry.handle.clone(), binding, entry.next_command_id)
        };

        let stored_id = i64::try_from(command_id)
            .map_err(|_| ServerError::Internal("command id out of range".to_string()))?;
        let log = self
            .storage
            .create_command_log(NewCommandLog {
                rover_id: binding.rover_id,
                command_id: Some(stored_id),
                command: command.to_string(),
                origin: CommandOrigin::Server,
                status: CommandStatus::Pending,
                response: None,
            })
            .await?;

        let now = Utc::now();
        let pending = PendingCommand {
            command_id,
            rover_identifier: binding.identifier.clone(),
            command: command.to_string(),
            status: CommandStatus::Pending,
            result: None,
            dispatched_at: now,
            log_id: log.id,
        };

        let rejected = {
            let mut links = self.links.write().await;
            match links.by_id.get_mut(&link) {
                Some(entry) if !entry.superseded => {
                    entry.pending.insert(command_id, pending.clone());
                    None
                }
                Some(_) => Some(SESSION_SUPERSEDED),
                None => Some(SESSION_CLOSED),
            }
        };
        if let Some(reason) = rejected {
            self.fail_commands(vec![pending], reason).await?;
            return Err(no_session());
        }

        let envelope = Envelope::new(
            MessageType::Command,
            &CommandPayload {
                command_id,
                command: command.to_string(),
                timestamp: now,
            },
        );
        if let Err(e) = handle.send(envelope) {
            tracing::warn!(rover_id = identifier, command_id, error = %e, "command not queued");
            let removed = self
                .links
                .write()
                .await
                .by_id
                .get_mut(&link)
                .and_then(|entry| entry.pending.remove(&command_id));
            if let Some(command) = removed {
                self.fail_commands(vec![command], LINK_UNAVAILABLE).await?;
            }
            return Err(no_session());
        }

        tracing::info!(rover_id = identifier, command_id, %command, "command dispatched");
        Ok(pending)
    }

    /// Resolves a pending command from a `command_response`.
    ///
    /// Returns the updated command, or `None` if the id is not pending on
    /// this link (logged and discarded).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Storage`] if the command log row could not be
    /// updated.
    pub async fn on_command_response(
        &self,
        link: LinkId,
        response: CommandResponsePayload,
    ) -> Result<Option<PendingCommand>, ServerError> {
        let command_id = response.command_id;
        let resolved = {
            let mut links = self.links.write().await;
            links.by_id.get_mut(&link).and_then(|entry| {
                if response.status.is_terminal() {
                    entry.pending.remove(&command_id)
                } else {
                    entry.pending.get(&command_id).cloned()
                }
            })
        };
        let Some(mut command) = resolved else {
            tracing::warn!(%link, command_id, "response for unknown command discarded");
            return Ok(None);
        };

        command.status = response.status;
        command.result = Some(response.result.clone());
        tracing::info!(
            rover_id = %command.rover_identifier,
            command_id,
            status = %command.status,
            "command resolved"
        );

        self.storage
            .update_command_log(
                command.log_id,
                CommandLogUpdate {
                    status: response.status,
                    response: Some(response.result),
                },
            )
            .await?;
        Ok(Some(command))
    }

    /// Logs a command the rover executed on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Storage`] if the log row could not be written.
    pub async fn on_local_command(
        &self,
        link: LinkId,
        local: LocalCommandPayload,
    ) -> Result<Option<CommandLog>, ServerError> {
        let Some(binding) = self.active_binding(link).await else {
            tracing::warn!(%link, "local_command from unregistered link dropped");
            return Ok(None);
        };
        tracing::info!(
            rover_id = %binding.identifier,
            command = %local.command,
            status = %local.status,
            "local command reported"
        );
        let log = self
            .storage
            .create_command_log(NewCommandLog {
                rover_id: binding.rover_id,
                command_id: None,
                command: local.command,
                origin: CommandOrigin::Local,
                status: local.status,
                response: Some(local.result),
            })
            .await?;
        Ok(Some(log))
    }

    /// Notes a rover's courtesy `disconnect`. The close follows separately.
    pub async fn on_disconnect(&self, link: LinkId, notice: &DisconnectPayload) {
        let identifier = self
            .active_binding(link)
            .await
            .map(|binding| binding.identifier);
        tracing::info!(%link, rover_id = ?identifier, reason = %notice.reason, "rover announced disconnect");
    }

    /// Tears down `link`.
    ///
    /// Pending commands fail with [`SESSION_CLOSED`]. The rover is marked
    /// disconnected only if this link still held its identity. A link
    /// superseded by a registration still in progress does not.
    ///
    /// # Errors
    ///
    /// Returns the first [`ServerError::Storage`] hit while persisting; all
    /// updates are still attempted.
    pub async fn on_link_close(&self, link: LinkId) -> Result<(), ServerError> {
        let (entry, was_active) = {
            let mut guard = self.links.write().await;
            let links = &mut *guard;
            let Some(entry) = links.by_id.remove(&link) else {
                return Ok(());
            };
            let was_active = match &entry.claim {
                Some(identifier) if links.active.get(identifier) == Some(&link) => {
                    links.active.remove(identifier);
                    true
                }
                _ => false,
            };
            (entry, was_active)
        };

        let LinkEntry {
            binding, pending, ..
        } = entry;
        tracing::info!(
            %link,
            rover_id = ?binding.as_ref().map(|b| b.identifier.as_str()),
            failed_commands = pending.len(),
            "link closed"
        );

        let mut result = self
            .fail_commands(pending.into_values().collect(), SESSION_CLOSED)
            .await;

        if was_active && let Some(binding) = binding {
            let offline = self
                .mark_offline(binding.rover_id, binding.rover_client_id)
                .await;
            result = result.and(offline);
        }
        result
    }

    async fn fail_commands(
        &self,
        commands: Vec<PendingCommand>,
        reason: &str,
    ) -> Result<(), ServerError> {
        let mut first_error = None;
        for command in commands {
            tracing::warn!(
                rover_id = %command.rover_identifier,
                command_id = command.command_id,
                reason,
                "pending command failed"
            );
            let update = CommandLogUpdate {
                status: CommandStatus::Failed,
                response: Some(reason.to_string()),
            };
            if let Err(e) = self.storage.update_command_log(command.log_id, update).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Decodes one text frame from `link` and routes it.
    ///
    /// Malformed frames, unknown types and invalid payloads are logged and
    /// dropped without touching any state. Frames on a superseded link
    /// other than `ping`/`pong` are ignored.
    ///
    /// # Errors
    ///
    /// Propagates the error of the operation the frame was routed to.
    pub async fn handle_frame(&self, link: LinkId, frame: &str) -> Result<(), ServerError> {
        let envelope = match protocol::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(%link, error = %e, "dropping frame");
                return Ok(());
            }
        };

        let msg_type = envelope.msg_type;
        if !matches!(msg_type, MessageType::Ping | MessageType::Pong) && self.is_superseded(link).await
        {
            tracing::debug!(%link, %msg_type, "frame on superseded link ignored");
            return Ok(());
        }

        match msg_type {
            MessageType::Registration => {
                if let Some(payload) = payload::<RegistrationPayload>(link, &envelope) {
                    self.on_registration(link, &payload).await?;
                }
            }
            MessageType::Ping => self.on_ping(link).await?,
            MessageType::Pong => self.on_pong(link).await?,
            MessageType::Telemetry => {
                if let Some(payload) = payload::<TelemetryPayload>(link, &envelope) {
                    self.on_telemetry(link, payload).await?;
                }
            }
            MessageType::CommandResponse => {
                if let Some(payload) = payload::<CommandResponsePayload>(link, &envelope) {
                    self.on_command_response(link, payload).await?;
                }
            }
            MessageType::LocalCommand => {
                if let Some(payload) = payload::<LocalCommandPayload>(link, &envelope) {
                    self.on_local_command(link, payload).await?;
                }
            }
            MessageType::Disconnect => {
                if let Some(payload) = payload::<DisconnectPayload>(link, &envelope) {
                    self.on_disconnect(link, &payload).await;
                }
            }
            MessageType::RegistrationAck | MessageType::Command => {
                tracing::warn!(%link, %msg_type, "unexpected message from rover");
            }
        }
        Ok(())
    }

    async fn is_superseded(&self, link: LinkId) -> bool {
        self.links
            .read()
            .await
            .by_id
            .get(&link)
            .is_some_and(|entry| entry.superseded)
    }

    /// Live, registered sessions ordered by rover identity.
    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        let links = self.links.read().await;
        let mut sessions: Vec<SessionInfo> = links
            .active
            .values()
            .filter_map(|link| links.by_id.get(link))
            .filter_map(|entry| {
                let binding = entry.active_binding()?;
                Some(SessionInfo {
                    link_id: entry.handle.id(),
                    identifier: binding.identifier.clone(),
                    rover_id: binding.rover_id,
                    rover_client_id: binding.rover_client_id,
                    remote_addr: entry.handle.remote_addr().map(|a| a.to_string()),
                    connected_at: binding.connected_at,
                    last_ping: binding.last_ping,
                    pending_commands: entry.pending.len(),
                })
            })
            .collect();
        sessions.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        sessions
    }

    /// Whether `identifier` currently has a live session.
    pub async fn is_connected(&self, identifier: &str) -> bool {
        let links = self.links.read().await;
        links
            .active
            .get(identifier)
            .and_then(|link| links.by_id.get(link))
            .is_some_and(|entry| entry.active_binding().is_some())
    }

    /// Commands pending on the active session of `identifier`, by id.
    pub async fn pending_commands(&self, identifier: &str) -> Vec<PendingCommand> {
        let links = self.links.read().await;
        let mut pending: Vec<PendingCommand> = links
            .active
            .get(identifier)
            .and_then(|link| links.by_id.get(link))
            .map(|entry| entry.pending.values().cloned().collect())
            .unwrap_or_default();
        pending.sort_by_key(|command| command.command_id);
        pending
    }

    /// Number of open links, registered or not.
    pub async fn link_count(&self) -> usize {
        self.links.read().await.by_id.len()
    }

    /// Deletes the stored session record of a disconnected rover.
    ///
    /// # Errors
    ///
    /// - [`ServerError::SessionStillActive`] while the rover is connected.
    /// - [`ServerError::RoverNotFound`] if no session record exists.
    /// - [`ServerError::Storage`] on persistence failure.
    pub async fn forget_session(&self, identifier: &str) -> Result<RoverSession, ServerError> {
        if self.is_connected(identifier).await {
            return Err(ServerError::SessionStillActive(identifier.to_string()));
        }
        let session = self
            .storage
            .get_session_by_identifier(identifier)
            .await?
            .ok_or_else(|| ServerError::RoverNotFound(identifier.to_string()))?;
        self.storage.delete_session(session.id).await?;
        tracing::info!(rover_id = identifier, session_id = session.id, "session record deleted");
        Ok(session)
    }

    /// Asks every link silent for at least `timeout` to close.
    ///
    /// Registered links are judged by their last `ping`/`pong`, unbound
    /// links by their accept time. Superseded links stop refreshing and
    /// age out here. The link tasks then run
    /// [`Self::on_link_close`] as usual. Returns the links asked to close.
    pub async fn evict_stale(&self, timeout: Duration) -> Vec<LinkId> {
        let Some(cutoff) = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
        else {
            return Vec::new();
        };

        let links = self.links.read().await;
        links
            .by_id
            .values()
            .filter(|entry| {
                let last_heard = entry
                    .binding
                    .as_ref()
                    .map_or(entry.opened_at, |binding| binding.last_ping);
                last_heard <= cutoff
            })
            .map(|entry| {
                let link = entry.handle.id();
                tracing::warn!(%link, "closing silent link");
                entry.handle.request_close();
                link
            })
            .collect()
    }
}

fn payload<T: serde::de::DeserializeOwned>(link: LinkId, envelope: &Envelope) -> Option<T> {
    match envelope.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(%link, error = %e, "dropping frame");
            None
        }
    }
}
