//! Ordered schema migrations with drift detection.
//!
//! Migrations are applied at startup in version order inside a single
//! connection. Each applied migration is recorded in `schema_migrations`
//! together with a SHA-256 hash of its SQL text; if the source of an
//! already-applied migration changes, startup fails with
//! [`StoreError::MigrationDrift`] instead of silently diverging.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreError;

/// One migration: version, short name, SQL text.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: "\
CREATE TABLE kiosks (
    kiosk_id    TEXT PRIMARY KEY,
    zone_id     TEXT,
    version     TEXT,
    hardware_id TEXT,
    config_hash TEXT,
    status      TEXT NOT NULL DEFAULT 'offline',
    last_seen   TEXT,
    active      INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE lockers (
    kiosk_id       TEXT NOT NULL,
    id             INTEGER NOT NULL,
    status         TEXT NOT NULL DEFAULT 'free',
    owner_type     TEXT,
    owner_key      TEXT,
    reserved_at    TEXT,
    owned_at       TEXT,
    is_vip         INTEGER NOT NULL DEFAULT 0,
    blocked_reason TEXT,
    version        INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (kiosk_id, id)
);
CREATE UNIQUE INDEX idx_lockers_rfid_owner
    ON lockers (owner_key)
    WHERE owner_type = 'rfid' AND status IN ('reserved', 'owned');
CREATE INDEX idx_lockers_kiosk_status ON lockers (kiosk_id, status);
CREATE TABLE events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kiosk_id   TEXT NOT NULL,
    locker_id  INTEGER,
    event_type TEXT NOT NULL,
    actor      TEXT NOT NULL,
    details    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_events_created ON events (created_at);
CREATE INDEX idx_events_kiosk ON events (kiosk_id, created_at);
CREATE TABLE meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
",
    },
    Migration {
        version: 2,
        name: "command queue",
        sql: "\
CREATE TABLE commands (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id      TEXT NOT NULL UNIQUE,
    kiosk_id        TEXT NOT NULL,
    command_type    TEXT NOT NULL,
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    created_at      TEXT NOT NULL,
    picked_at       TEXT,
    completed_at    TEXT,
    next_attempt_at TEXT
);
CREATE INDEX idx_commands_kiosk_status ON commands (kiosk_id, status, seq);
",
    },
    Migration {
        version: 3,
        name: "vip contracts and config versions",
        sql: "\
CREATE TABLE vip_contracts (
    contract_id      TEXT PRIMARY KEY,
    kiosk_id         TEXT NOT NULL,
    locker_id        INTEGER NOT NULL,
    rfid_card        TEXT NOT NULL,
    start_date       TEXT NOT NULL,
    end_date         TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'active',
    plan             TEXT,
    transfer_to_card TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE UNIQUE INDEX idx_vip_active_locker
    ON vip_contracts (kiosk_id, locker_id) WHERE status = 'active';
CREATE UNIQUE INDEX idx_vip_active_card
    ON vip_contracts (rfid_card) WHERE status = 'active';
CREATE TABLE config_versions (
    version    INTEGER PRIMARY KEY AUTOINCREMENT,
    doc        TEXT NOT NULL,
    hash       TEXT NOT NULL,
    applied    INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
",
    },
    Migration {
        version: 4,
        name: "kiosk telemetry samples",
        sql: "\
CREATE TABLE telemetry_samples (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    kiosk_id   TEXT NOT NULL,
    sample     TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_telemetry_created ON telemetry_samples (created_at);
",
    },
];

fn content_hash(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

/// Apply all pending migrations in version order.
///
/// # Errors
///
/// - [`StoreError::Migration`] if a statement fails.
/// - [`StoreError::MigrationDrift`] if an applied migration's SQL changed.
pub(crate) async fn apply(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
             version    INTEGER PRIMARY KEY, \
             name       TEXT NOT NULL, \
             hash       TEXT NOT NULL, \
             applied_at TEXT NOT NULL\
         )",
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Migration {
        version: 0,
        reason: e.to_string(),
    })?;

    for m in MIGRATIONS {
        let hash = content_hash(m.sql);

        let recorded: Option<(String,)> =
            sqlx::query_as("SELECT hash FROM schema_migrations WHERE version = ?")
                .bind(m.version)
                .fetch_optional(pool)
                .await
                .map_err(|e| StoreError::Migration {
                    version: m.version,
                    reason: e.to_string(),
                })?;

        if let Some((recorded_hash,)) = recorded {
            if recorded_hash != hash {
                return Err(StoreError::MigrationDrift {
                    version: m.version,
                    recorded: recorded_hash,
                    current: hash,
                });
            }
            continue;
        }

        sqlx::raw_sql(m.sql)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Migration {
                version: m.version,
                reason: e.to_string(),
            })?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, name, hash, applied_at) VALUES (?, ?, ?, ?)",
        )
        .bind(m.version)
        .bind(m.name)
        .bind(&hash)
        .bind(chrono::Utc::now())
        .execute(pool)
        .await
        .map_err(|e| StoreError::Migration {
            version: m.version,
            reason: e.to_string(),
        })?;

        info!(version = m.version, name = m.name, "migration applied");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_cleanly_and_are_idempotent() {
        let pool = crate::test_pool().await;
        // `test_pool` already ran `apply` once; a second run must be a no-op.
        apply(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn drift_is_detected() {
        let pool = crate::test_pool().await;

        sqlx::query("UPDATE schema_migrations SET hash = 'tampered' WHERE version = 1")
            .execute(&pool)
            .await
            .unwrap();

        let err = apply(&pool).await.unwrap_err();
        assert!(matches!(err, StoreError::MigrationDrift { version: 1, .. }));
    }
}
