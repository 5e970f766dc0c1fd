//! Database connection pool manager.
//!
//! SQLite with WAL mode for concurrent access. Handles connection
//! lifecycle, migrations, and pragmas.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::error::DatabaseError;

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Create a connection pool with WAL mode enabled.
    ///
    /// # Arguments
    /// * `database_url` - SQLite URL (e.g. "sqlite:zmcp.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // Every connection to ":memory:" opens its own database, so the
        // pool must collapse to a single connection there.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 10 };
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .idle_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(1800))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run pending migrations. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections; call during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
