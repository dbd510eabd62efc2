use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use rusqlite::types::Type;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::error::StorageError;
use crate::models::{MeasurementRecord, StoredMeasurement};

/// Durable home for validated measurements.
pub trait MeasurementStore: Send + Sync {
    /// Appends one record atomically and returns its row id.
    fn store(&self, record: &MeasurementRecord) -> Result<i64, StorageError>;

    /// Newest records first.
    fn latest(&self, limit: usize) -> Result<Vec<StoredMeasurement>, StorageError>;
}

pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    /// Opens the connection pool for the configured database.
    pub fn new(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let path = config.database_path();
        let busy_timeout = config.query_timeout;

        let (manager, max_size) = if path == ":memory:" {
            // Every in-memory connection is its own database.
            (SqliteConnectionManager::memory(), 1)
        } else {
            (SqliteConnectionManager::file(&path), config.pool_size)
        };
        let manager = manager.with_init(move |conn| conn.busy_timeout(busy_timeout));

        let pool = Pool::builder()
            .max_size(max_size)
            .connection_timeout(config.query_timeout)
            .build(manager)
            .map_err(|e| {
                error!("Failed to open database '{}': {}", path, e);
                StorageError::ConnectionRefused(e.to_string())
            })?;

        info!(
            "Opened measurement store '{}' with {} pooled connection(s).",
            path, max_size
        );
        Ok(Self { pool })
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<(), StorageError> {
        let conn = self.pool.get()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            temperature REAL NOT NULL,
            humidity REAL NOT NULL,
            sensor_id TEXT NOT NULL,
            received_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_measurements_sensor
            ON measurements (sensor_id, received_at);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }
}

impl MeasurementStore for DatabaseService {
    fn store(&self, record: &MeasurementRecord) -> Result<i64, StorageError> {
        let received_at = record
            .received_at
            .format(&Rfc3339)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // The pooled connection goes back to the pool when it drops, and an
        // uncommitted transaction rolls back on drop.
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO measurements (temperature, humidity, sensor_id, received_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.temperature,
                record.humidity,
                record.sensor_id,
                received_at
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("Stored measurement {} from sensor '{}'.", id, record.sensor_id);
        Ok(id)
    }

    fn latest(&self, limit: usize) -> Result<Vec<StoredMeasurement>, StorageError> {
        let conn = self.pool.get()?;

        let mut stmt = conn.prepare(
            "SELECT id, temperature, humidity, sensor_id, received_at
             FROM measurements
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let received_at: String = row.get(4)?;
            let received_at = OffsetDateTime::parse(&received_at, &Rfc3339).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
            })?;
            Ok(StoredMeasurement {
                id: row.get(0)?,
                record: MeasurementRecord {
                    temperature: row.get(1)?,
                    humidity: row.get(2)?,
                    sensor_id: row.get(3)?,
                    received_at,
                },
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }
}
