//! PostgreSQL storage backend using `sqlx::PgPool`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::models::{
    CommandLog, CommandLogUpdate, NewCommandLog, NewRover, NewRoverSession, NewTelemetrySample,
    Rover, RoverSession, RoverUpdate, SessionUpdate, TelemetrySample,
};
use super::{Storage, StorageError};
use crate::config::DatabaseConfig;
use crate::protocol::TelemetryReading;

const ROVER_COLUMNS: &str = "id, identifier, name, address, is_connected, battery_level, \
     last_seen, metadata, created_at, updated_at";

const TELEMETRY_COLUMNS: &str = "id, rover_id, temperature, humidity, pressure, altitude, \
     heading, speed, tilt, latitude, longitude, battery_level, signal_strength, recorded_at";

const COMMAND_LOG_COLUMNS: &str =
    "id, rover_id, command_id, command, origin, status, response, created_at, updated_at";

const SESSION_COLUMNS: &str =
    "id, rover_id, identifier, is_connected, last_ping, created_at, updated_at";

type RoverRow = (
    i64,
    String,
    String,
    Option<String>,
    bool,
    Option<f64>,
    Option<DateTime<Utc>>,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
);

type TelemetryRow = (
    i64,
    i64,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    DateTime<Utc>,
);

type CommandLogRow = (
    i64,
    i64,
    Option<i64>,
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
);

type SessionRow = (i64, i64, String, bool, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>);

/// PostgreSQL-backed storage.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the database is unreachable or
    /// a migration fails.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(backend)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        tracing::info!("postgres storage ready");
        Ok(Self::new(pool))
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn conflict_or_backend(e: sqlx::Error, what: String) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict(what),
        _ => backend(e),
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn rover_from_row(row: RoverRow) -> Rover {
    let (
        id,
        identifier,
        name,
        address,
        is_connected,
        battery_level,
        last_seen,
        metadata,
        created_at,
        updated_at,
    ) = row;
    Rover {
        id,
        identifier,
        name,
        address,
        is_connected,
        battery_level,
        last_seen,
        metadata,
        created_at,
        updated_at,
    }
}

fn telemetry_from_row(row: TelemetryRow) -> TelemetrySample {
    let (
        id,
        rover_id,
        temperature,
        humidity,
        pressure,
        altitude,
        heading,
        speed,
        tilt,
        latitude,
        longitude,
        battery_level,
        signal_strength,
        recorded_at,
    ) = row;
    TelemetrySample {
        id,
        rover_id,
        reading: TelemetryReading {
            temperature,
            humidity,
            pressure,
            altitude,
            heading,
            speed,
            tilt,
            latitude,
            longitude,
            battery_level,
            signal_strength,
        },
        recorded_at,
    }
}

fn command_log_from_row(row: CommandLogRow) -> Result<CommandLog, StorageError> {
    let (id, rover_id, command_id, command, origin, status, response, created_at, updated_at) = row;
    Ok(CommandLog {
        id,
        rover_id,
        command_id,
        command,
        origin: origin.parse().map_err(StorageError::Backend)?,
        status: status.parse().map_err(StorageError::Backend)?,
        response,
        created_at,
        updated_at,
    })
}

fn session_from_row(row: SessionRow) -> RoverSession {
    let (id, rover_id, identifier, is_connected, last_ping, created_at, updated_at) = row;
    RoverSession {
        id,
        rover_id,
        identifier,
        is_connected,
        last_ping,
        created_at,
        updated_at,
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get_rover_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<Rover>, StorageError> {
        let row = sqlx::query_as::<_, RoverRow>(&format!(
            "SELECT {ROVER_COLUMNS} FROM rovers WHERE identifier = $1"
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(rover_from_row))
    }

    async fn list_rovers(&self) -> Result<Vec<Rover>, StorageError> {
        let rows = sqlx::query_as::<_, RoverRow>(&format!(
            "SELECT {ROVER_COLUMNS} FROM rovers ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(rover_from_row).collect())
    }

    async fn create_rover(&self, rover: NewRover) -> Result<Rover, StorageError> {
        let identifier = rover.identifier.clone();
        let row = sqlx::query_as::<_, RoverRow>(&format!(
            "INSERT INTO rovers (identifier, name, address, is_connected, metadata) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {ROVER_COLUMNS}"
        ))
        .bind(rover.identifier)
        .bind(rover.name)
        .bind(rover.address)
        .bind(rover.is_connected)
        .bind(rover.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or_backend(e, format!("rover {identifier} already exists")))?;
        Ok(rover_from_row(row))
    }

    async fn update_rover(&self, id: i64, update: RoverUpdate) -> Result<Rover, StorageError> {
        let row = sqlx::query_as::<_, RoverRow>(&format!(
            "UPDATE rovers SET \
                 name = COALESCE($2, name), \
                 address = COALESCE($3, address), \
                 is_connected = COALESCE($4, is_connected), \
                 battery_level = COALESCE($5, battery_level), \
                 last_seen = COALESCE($6, last_seen), \
                 metadata = COALESCE($7, metadata), \
                 updated_at = NOW() \
             WHERE id = $1 RETURNING {ROVER_COLUMNS}"
        ))
        .bind(id)
        .bind(update.name)
        .bind(update.address)
        .bind(update.is_connected)
        .bind(update.battery_level)
        .bind(update.last_seen)
        .bind(update.metadata)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(rover_from_row).ok_or(StorageError::NotFound {
            entity: "rover",
            id: id.to_string(),
        })
    }

    async fn create_telemetry(
        &self,
        sample: NewTelemetrySample,
    ) -> Result<TelemetrySample, StorageError> {
        let r = sample.reading;
        let row = sqlx::query_as::<_, TelemetryRow>(&format!(
            "INSERT INTO telemetry (rover_id, temperature, humidity, pressure, altitude, \
                 heading, speed, tilt, latitude, longitude, battery_level, signal_strength, \
                 recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {TELEMETRY_COLUMNS}"
        ))
        .bind(sample.rover_id)
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.pressure)
        .bind(r.altitude)
        .bind(r.heading)
        .bind(r.speed)
        .bind(r.tilt)
        .bind(r.latitude)
        .bind(r.longitude)
        .bind(r.battery_level)
        .bind(r.signal_strength)
        .bind(sample.recorded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(telemetry_from_row(row))
    }

    async fn get_telemetry_by_rover(
        &self,
        rover_id: i64,
        limit: usize,
    ) -> Result<Vec<TelemetrySample>, StorageError> {
        let rows = sqlx::query_as::<_, TelemetryRow>(&format!(
            "SELECT {TELEMETRY_COLUMNS} FROM telemetry WHERE rover_id = $1 \
             ORDER BY recorded_at DESC, id DESC LIMIT $2"
        ))
        .bind(rover_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(telemetry_from_row).collect())
    }

    async fn create_command_log(&self, log: NewCommandLog) -> Result<CommandLog, StorageError> {
        let row = sqlx::query_as::<_, CommandLogRow>(&format!(
            "INSERT INTO command_logs (rover_id, command_id, command, origin, status, response) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {COMMAND_LOG_COLUMNS}"
        ))
        .bind(log.rover_id)
        .bind(log.command_id)
        .bind(log.command)
        .bind(log.origin.as_str())
        .bind(log.status.as_str())
        .bind(log.response)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        command_log_from_row(row)
    }

    async fn update_command_log(
        &self,
        id: i64,
        update: CommandLogUpdate,
    ) -> Result<CommandLog, StorageError> {
        let row = sqlx::query_as::<_, CommandLogRow>(&format!(
            "UPDATE command_logs SET status = $2, response = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING {COMMAND_LOG_COLUMNS}"
        ))
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.response)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        let row = row.ok_or(StorageError::NotFound {
            entity: "command log",
            id: id.to_string(),
        })?;
        command_log_from_row(row)
    }

    async fn get_command_logs_by_rover(
        &self,
        rover_id: i64,
        limit: usize,
    ) -> Result<Vec<CommandLog>, StorageError> {
        let rows = sqlx::query_as::<_, CommandLogRow>(&format!(
            "SELECT {COMMAND_LOG_COLUMNS} FROM command_logs WHERE rover_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        ))
        .bind(rover_id)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(command_log_from_row).collect()
    }

    async fn get_session_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<RoverSession>, StorageError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM rover_sessions WHERE identifier = $1"
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(session_from_row))
    }

    async fn create_session(
        &self,
        session: NewRoverSession,
    ) -> Result<RoverSession, StorageError> {
        let identifier = session.identifier.clone();
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "INSERT INTO rover_sessions (rover_id, identifier, is_connected, last_ping) \
             VALUES ($1, $2, $3, $4) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session.rover_id)
        .bind(session.identifier)
        .bind(session.is_connected)
        .bind(session.last_ping)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or_backend(e, format!("session for {identifier} already exists")))?;
        Ok(session_from_row(row))
    }

    async fn update_session(
        &self,
        id: i64,
        update: SessionUpdate,
    ) -> Result<RoverSession, StorageError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "UPDATE rover_sessions SET \
                 is_connected = COALESCE($2, is_connected), \
                 last_ping = COALESCE($3, last_ping), \
                 updated_at = NOW() \
             WHERE id = $1 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id)
        .bind(update.is_connected)
        .bind(update.last_ping)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(session_from_row).ok_or(StorageError::NotFound {
            entity: "session",
            id: id.to_string(),
        })
    }

    async fn delete_session(&self, id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM rover_sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
