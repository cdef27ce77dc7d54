//! Record storage consumed by the session registry.
//!
//! [`Storage`] is the only persistence seam. The registry receives an
//! explicitly constructed `Arc<dyn Storage>` at startup; the backend is
//! picked once from configuration and never swapped at runtime.
//!
//! Each operation is individually atomic. No operation spans more than one
//! record, so no multi-record transactions are needed.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStorage;
pub use models::{
    CommandLog, CommandLogUpdate, CommandOrigin, NewCommandLog, NewRover, NewRoverSession,
    NewTelemetrySample, Rover, RoverSession, RoverUpdate, SessionUpdate, TelemetrySample,
};
pub use postgres::PostgresStorage;

/// Storage failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The addressed record does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Record kind (`"rover"`, `"session"`, ...).
        entity: &'static str,
        /// Key that was looked up.
        id: String,
    },

    /// A unique key is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure (connection, query, decoding).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Keyed record store for rovers, telemetry, command logs and sessions.
///
/// Implementations must be safe under concurrent reads and writes from
/// many link tasks.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Looks up a rover by its identity string.
    async fn get_rover_by_identifier(&self, identifier: &str)
    -> Result<Option<Rover>, StorageError>;

    /// Lists all rovers ordered by id.
    async fn list_rovers(&self) -> Result<Vec<Rover>, StorageError>;

    /// Creates a rover. Fails with [`StorageError::Conflict`] if the
    /// identifier is taken.
    async fn create_rover(&self, rover: NewRover) -> Result<Rover, StorageError>;

    /// Applies a partial update to a rover.
    async fn update_rover(&self, id: i64, update: RoverUpdate) -> Result<Rover, StorageError>;

    /// Appends a telemetry sample.
    async fn create_telemetry(
        &self,
        sample: NewTelemetrySample,
    ) -> Result<TelemetrySample, StorageError>;

    /// Returns up to `limit` samples for a rover, newest first.
    async fn get_telemetry_by_rover(
        &self,
        rover_id: i64,
        limit: usize,
    ) -> Result<Vec<TelemetrySample>, StorageError>;

    /// Creates a command log row.
    async fn create_command_log(&self, log: NewCommandLog) -> Result<CommandLog, StorageError>;

    /// Updates the status and response of a command log row.
    async fn update_command_log(
        &self,
        id: i64,
        update: CommandLogUpdate,
    ) -> Result<CommandLog, StorageError>;

    /// Returns up to `limit` command log rows for a rover, newest first.
    async fn get_command_logs_by_rover(
        &self,
        rover_id: i64,
        limit: usize,
    ) -> Result<Vec<CommandLog>, StorageError>;

    /// Looks up the session record of a rover identity.
    async fn get_session_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<RoverSession>, StorageError>;

    /// Creates a session record. Fails with [`StorageError::Conflict`] if
    /// the identifier already has one.
    async fn create_session(&self, session: NewRoverSession)
    -> Result<RoverSession, StorageError>;

    /// Applies a partial update to a session record.
    async fn update_session(
        &self,
        id: i64,
        update: SessionUpdate,
    ) -> Result<RoverSession, StorageError>;

    /// Deletes a session record.
    async fn delete_session(&self, id: i64) -> Result<(), StorageError>;
}
