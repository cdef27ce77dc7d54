//! In-memory storage backend.
//!
//! Useful for development and single-process deployments. Data is lost on
//! restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::models::{
    CommandLog, CommandLogUpdate, NewCommandLog, NewRover, NewRoverSession, NewTelemetrySample,
    Rover, RoverSession, RoverUpdate, SessionUpdate, TelemetrySample,
};
use super::{Storage, StorageError};

#[derive(Debug, Default)]
struct Tables {
    rovers: BTreeMap<i64, Rover>,
    telemetry: BTreeMap<i64, TelemetrySample>,
    command_logs: BTreeMap<i64, CommandLog>,
    sessions: BTreeMap<i64, RoverSession>,
    next_id: i64,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id = self.next_id.saturating_add(1);
        self.next_id
    }
}

/// Storage backed by ordered maps behind a single async lock.
///
/// Row ids come from one counter shared by all tables, so ids are unique
/// across record kinds and increase with insertion order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(entity: &'static str, id: impl ToString) -> StorageError {
    StorageError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_rover_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Rover>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .rovers
            .values()
            .find(|r| r.identifier == identifier)
            .cloned())
    }

    async fn list_rovers(&self) -> Result<Vec<Rover>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.rovers.values().cloned().collect())
    }

    async fn create_rover(&self, rover: NewRover) -> Result<Rover, StorageError> {
        let mut tables = self.tables.write().await;
        if tables
            .rovers
            .values()
            .any(|r| r.identifier == rover.identifier)
        {
            return Err(StorageError::Conflict(format!(
                "rover {} already exists",
                rover.identifier
            )));
        }
        let id = tables.allocate_id();
        let now = Utc::now();
        let record = Rover {
            id,
            identifier: rover.identifier,
            name: rover.name,
            address: rover.address,
            is_connected: rover.is_connected,
            battery_level: None,
            last_seen: None,
            metadata: rover.metadata,
            created_at: now,
            updated_at: now,
        };
        tables.rovers.insert(id, record.clone());
        Ok(record)
    }

    async fn update_rover(&self, id: i64, update: RoverUpdate) -> Result<Rover, StorageError> {
        let mut tables = self.tables.write().await;
        let rover = tables
            .rovers
            .get_mut(&id)
            .ok_or_else(|| not_found("rover", id))?;
        if let Some(name) = update.name {
            rover.name = name;
        }
        if let Some(address) = update.address {
            rover.address = Some(address);
        }
        if let Some(connected) = update.is_connected {
            rover.is_connected = connected;
        }
        if let Some(level) = update.battery_level {
            rover.battery_level = Some(level);
        }
        if let Some(seen) = update.last_seen {
            rover.last_seen = Some(seen);
        }
        if let Some(metadata) = update.metadata {
            rover.metadata = metadata;
        }
        rover.updated_at = Utc::now();
        Ok(rover.clone())
    }

    async fn create_telemetry(
        &self,
        sample: NewTelemetrySample,
    ) -> Result<TelemetrySample, StorageError> {
        let mut tables = self.tables.write().await;
        if !tables.rovers.contains_key(&sample.rover_id) {
            return Err(not_found("rover", sample.rover_id));
        }
        let id = tables.allocate_id();
        let record = TelemetrySample {
            id,
            rover_id: sample.rover_id,
            reading: sample.reading,
            recorded_at: sample.recorded_at,
        };
        tables.telemetry.insert(id, record.clone());
        Ok(record)
    }

    async fn get_telemetry_by_rover(
        &self,
        rover_id: i64,
        limit: usize,
    ) -> Result<Vec<TelemetrySample>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .telemetry
            .values()
            .rev()
            .filter(|s| s.rover_id == rover_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_command_log(&self, log: NewCommandLog) -> Result<CommandLog, StorageError> {
        let mut tables = self.tables.write().await;
        if !tables.rovers.contains_key(&log.rover_id) {
            return Err(not_found("rover", log.rover_id));
        }
        let id = tables.allocate_id();
        let now = Utc::now();
        let record = CommandLog {
            id,
            rover_id: log.rover_id,
            command_id: log.command_id,
            command: log.command,
            origin: log.origin,
            status: log.status,
            response: log.response,
            created_at: now,
            updated_at: now,
        };
        tables.command_logs.insert(id, record.clone());
        Ok(record)
    }

    async fn update_command_log(
        &self,
        id: i64,
        update: CommandLogUpdate,
    ) -> Result<CommandLog, StorageError> {
        let mut tables = self.tables.write().await;
        let log = tables
            .command_logs
            .get_mut(&id)
            .ok_or_else(|| not_found("command log", id))?;
        log.status = update.status;
        log.response = update.response;
        log.updated_at = Utc::now();
        Ok(log.clone())
    }

    async fn get_command_logs_by_rover(
        &self,
        rover_id: i64,
        limit: usize,
    ) -> Result<Vec<CommandLog>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .command_logs
            .values()
            .rev()
            .filter(|l| l.rover_id == rover_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_session_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<RoverSession>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.identifier == identifier)
            .cloned())
    }

    async fn create_session(
        &self,
        session: NewRoverSession,
    ) -> Result<RoverSession, StorageError> {
        let mut tables = self.tables.write().await;
        if tables
            .sessions
            .values()
            .any(|s| s.identifier == session.identifier)
        {
            return Err(StorageError::Conflict(format!(
                "session for {} already exists",
                session.identifier
            )));
        }
        let id = tables.allocate_id();
        let now = Utc::now();
        let record = RoverSession {
            id,
            rover_id: session.rover_id,
            identifier: session.identifier,
            is_connected: session.is_connected,
            last_ping: session.last_ping,
            created_at: now,
            updated_at: now,
        };
        tables.sessions.insert(id, record.clone());
        Ok(record)
    }

    async fn update_session(
        &self,
        id: i64,
        update: SessionUpdate,
    ) -> Result<RoverSession, StorageError> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| not_found("session", id))?;
        if let Some(connected) = update.is_connected {
            session.is_connected = connected;
        }
        if let Some(last_ping) = update.last_ping {
            session.last_ping = last_ping;
        }
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn delete_session(&self, id: i64) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        tables
            .sessions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("session", id))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::{CommandStatus, TelemetryReading};
    use crate::storage::CommandOrigin;

    fn new_rover(identifier: &str) -> NewRover {
        NewRover {
            identifier: identifier.to_string(),
            name: identifier.to_string(),
            address: None,
            is_connected: false,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn create_and_lookup_rover() {
        let store = MemoryStorage::new();
        let Ok(created) = store.create_rover(new_rover("R-001")).await else {
            panic!("create rover");
        };
        let Ok(Some(found)) = store.get_rover_by_identifier("R-001").await else {
            panic!("rover should be found");
        };
        assert_eq!(found, created);
        assert!(matches!(
            store.get_rover_by_identifier("R-404").await,
            Ok(None)
        ));
    }

    #[tokio::test]
    async fn duplicate_rover_is_conflict() {
        let store = MemoryStorage::new();
        let _ = store.create_rover(new_rover("R-001")).await;
        let result = store.create_rover(new_rover("R-001")).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn update_rover_only_touches_given_fields() {
        let store = MemoryStorage::new();
        let Ok(rover) = store.create_rover(new_rover("R-001")).await else {
            panic!("create rover");
        };
        let update = RoverUpdate {
            is_connected: Some(true),
            battery_level: Some(64.0),
            ..RoverUpdate::default()
        };
        let Ok(updated) = store.update_rover(rover.id, update).await else {
            panic!("update rover");
        };
        assert!(updated.is_connected);
        assert_eq!(updated.battery_level, Some(64.0));
        assert_eq!(updated.name, "R-001");

        let missing = store.update_rover(999, RoverUpdate::default()).await;
        assert!(matches!(missing, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn telemetry_is_newest_first_and_bounded() {
        let store = MemoryStorage::new();
        let Ok(rover) = store.create_rover(new_rover("R-001")).await else {
            panic!("create rover");
        };
        for i in 0..5 {
            let sample = NewTelemetrySample {
                rover_id: rover.id,
                reading: TelemetryReading {
                    speed: Some(f64::from(i)),
                    ..TelemetryReading::default()
                },
                recorded_at: Utc::now(),
            };
            let _ = store.create_telemetry(sample).await;
        }
        let Ok(samples) = store.get_telemetry_by_rover(rover.id, 3).await else {
            panic!("query telemetry");
        };
        let speeds: Vec<Option<f64>> = samples.iter().map(|s| s.reading.speed).collect();
        assert_eq!(speeds, vec![Some(4.0), Some(3.0), Some(2.0)]);
    }

    #[tokio::test]
    async fn telemetry_for_unknown_rover_is_rejected() {
        let store = MemoryStorage::new();
        let sample = NewTelemetrySample {
            rover_id: 42,
            reading: TelemetryReading::default(),
            recorded_at: Utc::now(),
        };
        assert!(store.create_telemetry(sample).await.is_err());
    }

    #[tokio::test]
    async fn command_log_status_update() {
        let store = MemoryStorage::new();
        let Ok(rover) = store.create_rover(new_rover("R-001")).await else {
            panic!("create rover");
        };
        let Ok(log) = store
            .create_command_log(NewCommandLog {
                rover_id: rover.id,
                command_id: Some(1),
                command: "move_forward".to_string(),
                origin: CommandOrigin::Server,
                status: CommandStatus::Pending,
                response: None,
            })
            .await
        else {
            panic!("create command log");
        };
        let Ok(updated) = store
            .update_command_log(
                log.id,
                CommandLogUpdate {
                    status: CommandStatus::Completed,
                    response: Some("ok".to_string()),
                },
            )
            .await
        else {
            panic!("update command log");
        };
        assert_eq!(updated.status, CommandStatus::Completed);
        assert_eq!(updated.response.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let store = MemoryStorage::new();
        let Ok(rover) = store.create_rover(new_rover("R-001")).await else {
            panic!("create rover");
        };
        let new_session = NewRoverSession {
            rover_id: rover.id,
            identifier: "R-001".to_string(),
            is_connected: true,
            last_ping: Utc::now(),
        };
        let Ok(session) = store.create_session(new_session.clone()).await else {
            panic!("create session");
        };
        assert!(matches!(
            store.create_session(new_session).await,
            Err(StorageError::Conflict(_))
        ));

        let update = SessionUpdate {
            is_connected: Some(false),
            ..SessionUpdate::default()
        };
        let Ok(updated) = store.update_session(session.id, update).await else {
            panic!("update session");
        };
        assert!(!updated.is_connected);

        assert!(store.delete_session(session.id).await.is_ok());
        assert!(matches!(
            store.get_session_by_identifier("R-001").await,
            Ok(None)
        ));
        assert!(store.delete_session(session.id).await.is_err());
    }
}
