//! SQLite persistence for `lockerd`.
//!
//! This crate owns the connection pool, the ordered schema migrations, the
//! row types, and every SQL statement in the system. It knows nothing about
//! Modbus or HTTP; domain rules (which state transitions are legal, retry
//! policy, hashing of card ids) live in `lockerd-core`.
//!
//! Mutations of versioned rows use optimistic compare-and-set: the `UPDATE`
//! carries `WHERE version = ?` and a zero row count surfaces as
//! [`StoreError::Conflict`] for the caller to retry after re-reading.

mod commands;
mod config_versions;
mod error;
mod events;
mod kiosks;
mod lockers;
mod migrations;
mod vip;

pub use commands::{CommandRow, CommandStatus};
pub use config_versions::ConfigVersionRow;
pub use error::StoreError;
pub use events::{EventFilter, EventRow, NewEvent};
pub use kiosks::{KioskRow, KioskStatus, TelemetrySampleRow};
pub use lockers::{LockerMutation, LockerRow, LockerStatus, OwnerType};
pub use vip::{ContractStatus, VipContractRow};

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

/// Handle to the embedded database.
///
/// Cheap to clone (wraps a pool). All repository methods live in `impl Store`
/// blocks spread across the entity modules of this crate.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (creating if missing) the database file and apply migrations.
    ///
    /// WAL journal mode so reads stay concurrent with the write path; a busy
    /// timeout absorbs short write contention instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the pool cannot be created, or a
    /// migration error if the schema cannot be brought up to date.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Open {
                path: path.to_owned(),
                reason: e.to_string(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Open {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;

        migrations::apply(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database with migrations applied.
    ///
    /// A single connection, so every query sees the same memory database.
    /// Intended for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the pool cannot be created.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Open {
                path: ":memory:".to_owned(),
                reason: e.to_string(),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Open {
                path: ":memory:".to_owned(),
                reason: e.to_string(),
            })?;

        migrations::apply(&pool).await?;

        Ok(Self { pool })
    }

    /// Return the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Read a value from the `meta` table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn meta_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query {
                entity: "meta",
                reason: e.to_string(),
            })?;

        Ok(row.map(|(v,)| v))
    }

    /// Upsert a value into the `meta` table.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the write fails.
    pub async fn meta_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_write("meta", &e))?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) async fn test_pool() -> SqlitePool {
    Store::open_in_memory().await.unwrap().pool
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) async fn test_store() -> Store {
    Store::open_in_memory().await.unwrap()
}
