//! Versioned configuration documents.
//!
//! Every deploy inserts a new row; exactly one row is `applied` at a time.
//! Rollback re-applies the newest version below the current one, so the
//! history is never rewritten.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::Store;

/// One stored configuration version. `doc` is the raw JSON document,
/// `hash` its SHA-256 content hash.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConfigVersionRow {
    pub version: i64,
    pub doc: String,
    pub hash: String,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Insert a new (not yet applied) config version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the insert fails.
    pub async fn insert_config_version(
        &self,
        doc: &str,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfigVersionRow, StoreError> {
        let row: Option<ConfigVersionRow> = sqlx::query_as(
            "INSERT INTO config_versions (doc, hash, created_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(doc)
        .bind(hash)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("config_versions", &e))?;

        row.ok_or(StoreError::Write {
            entity: "config_versions",
            reason: "insert returned no row".to_owned(),
        })
    }

    /// The currently applied config version, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn applied_config(&self) -> Result<Option<ConfigVersionRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM config_versions WHERE applied = 1 ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "config_versions",
            reason: e.to_string(),
        })
    }

    /// Fetch one config version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn config_version(
        &self,
        version: i64,
    ) -> Result<Option<ConfigVersionRow>, StoreError> {
        sqlx::query_as("SELECT * FROM config_versions WHERE version = ?")
            .bind(version)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "config_versions",
                reason: e.to_string(),
            })
    }

    /// Mark one version applied and clear the flag everywhere else, in a
    /// single transaction.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the version does not exist.
    /// - [`StoreError::Write`] on other failures.
    pub async fn mark_config_applied(&self, version: i64) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await.map_err(|e| StoreError::Write {
            entity: "config_versions",
            reason: e.to_string(),
        })?;

        sqlx::query("UPDATE config_versions SET applied = 0 WHERE applied = 1")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write("config_versions", &e))?;

        let result = sqlx::query("UPDATE config_versions SET applied = 1 WHERE version = ?")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write("config_versions", &e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                entity: "config_versions",
            });
        }

        tx.commit().await.map_err(|e| StoreError::Write {
            entity: "config_versions",
            reason: e.to_string(),
        })?;

        Ok(())
    }

    /// The newest version strictly below `version` (rollback target).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn config_version_before(
        &self,
        version: i64,
    ) -> Result<Option<ConfigVersionRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM config_versions WHERE version < ? ORDER BY version DESC LIMIT 1",
        )
        .bind(version)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "config_versions",
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_is_exclusive() {
        let store = crate::test_store().await;
        let now = Utc::now();

        let v1 = store.insert_config_version("{\"a\":1}", "h1", now).await.unwrap();
        let v2 = store.insert_config_version("{\"a\":2}", "h2", now).await.unwrap();
        assert!(v2.version > v1.version);

        store.mark_config_applied(v1.version).await.unwrap();
        store.mark_config_applied(v2.version).await.unwrap();

        let applied = store.applied_config().await.unwrap().unwrap();
        assert_eq!(applied.version, v2.version);

        let old = store.config_version(v1.version).await.unwrap().unwrap();
        assert!(!old.applied);
    }

    #[tokio::test]
    async fn rollback_target_is_previous_version() {
        let store = crate::test_store().await;
        let now = Utc::now();

        let v1 = store.insert_config_version("{}", "h1", now).await.unwrap();
        let v2 = store.insert_config_version("{}", "h2", now).await.unwrap();

        let before = store.config_version_before(v2.version).await.unwrap().unwrap();
        assert_eq!(before.version, v1.version);
        assert!(store.config_version_before(v1.version).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn applying_unknown_version_is_a_conflict() {
        let store = crate::test_store().await;
        let err = store.mark_config_applied(42).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
