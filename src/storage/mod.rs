//! SQLite storage for cost events.

pub mod logging;

pub use logging::{insert_event, spawn_event_write};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::sink::{CostEvent, CostEventSink, SinkError};

/// Initialize the SQLite connection pool and run migrations.
///
/// The database file is created automatically if it doesn't exist.
/// WAL journal mode is used for concurrent read/write performance.
pub async fn init_pool(db_path: &str) -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Apply the embedded migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

/// Appends cost events to the `cost_events` table without waiting for the write.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CostEventSink for SqliteSink {
    async fn record(&self, event: &CostEvent) -> Result<(), SinkError> {
        if self.pool.is_closed() {
            return Err(SinkError::Unavailable("database pool is closed".to_string()));
        }
        spawn_event_write(&self.pool, event.clone());
        Ok(())
    }
}
