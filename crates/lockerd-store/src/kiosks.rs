//! Kiosk rows: liveness, software version, telemetry samples.
//!
//! Kiosks are created implicitly by their first heartbeat and are never
//! deleted, only flagged inactive. The offline sweep is a single UPDATE so
//! a burst of late heartbeats cannot race individual row flips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::Store;

/// Kiosk liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum KioskStatus {
    Online,
    Offline,
    Maintenance,
    Error,
}

/// One kiosk row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct KioskRow {
    pub kiosk_id: String,
    pub zone_id: Option<String>,
    pub version: Option<String>,
    pub hardware_id: Option<String>,
    pub config_hash: Option<String>,
    pub status: KioskStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub active: bool,
}

/// One stored telemetry sample (opaque JSON payload).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TelemetrySampleRow {
    pub id: i64,
    pub kiosk_id: String,
    pub sample: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Record a heartbeat: upsert the kiosk, refresh `last_seen`, and bring
    /// it back `online`. Kiosks in `maintenance` stay in `maintenance`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the upsert fails.
    pub async fn kiosk_heartbeat(
        &self,
        kiosk_id: &str,
        version: &str,
        hardware_id: Option<&str>,
        config_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<KioskRow, StoreError> {
        let row: Option<KioskRow> = sqlx::query_as(
            "INSERT INTO kiosks (kiosk_id, version, hardware_id, config_hash, status, last_seen) \
             VALUES (?, ?, ?, ?, 'online', ?) \
             ON CONFLICT (kiosk_id) DO UPDATE SET \
                 version = excluded.version, \
                 hardware_id = COALESCE(excluded.hardware_id, kiosks.hardware_id), \
                 config_hash = COALESCE(excluded.config_hash, kiosks.config_hash), \
                 status = CASE kiosks.status WHEN 'maintenance' THEN 'maintenance' ELSE 'online' END, \
                 last_seen = excluded.last_seen \
             RETURNING *",
        )
        .bind(kiosk_id)
        .bind(version)
        .bind(hardware_id)
        .bind(config_hash)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("kiosks", &e))?;

        row.ok_or(StoreError::Write {
            entity: "kiosks",
            reason: "heartbeat upsert returned no row".to_owned(),
        })
    }

    /// Mark stale `online` kiosks `offline`. Returns the ids flipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn kiosks_mark_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "UPDATE kiosks SET status = 'offline' \
             WHERE status = 'online' AND (last_seen IS NULL OR last_seen < ?) \
             RETURNING kiosk_id",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::from_write("kiosks", &e))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Fetch one kiosk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn kiosk(&self, kiosk_id: &str) -> Result<Option<KioskRow>, StoreError> {
        sqlx::query_as("SELECT * FROM kiosks WHERE kiosk_id = ?")
            .bind(kiosk_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "kiosks",
                reason: e.to_string(),
            })
    }

    /// All kiosks, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn all_kiosks(&self) -> Result<Vec<KioskRow>, StoreError> {
        sqlx::query_as("SELECT * FROM kiosks ORDER BY kiosk_id")
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "kiosks",
                reason: e.to_string(),
            })
    }

    /// Kiosks assigned to a zone, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn kiosks_by_zone(&self, zone_id: &str) -> Result<Vec<KioskRow>, StoreError> {
        sqlx::query_as("SELECT * FROM kiosks WHERE zone_id = ? ORDER BY kiosk_id")
            .bind(zone_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "kiosks",
                reason: e.to_string(),
            })
    }

    /// Assign a kiosk to a zone (or clear the assignment).
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the kiosk does not exist.
    /// - [`StoreError::Write`] on other failures.
    pub async fn set_kiosk_zone(
        &self,
        kiosk_id: &str,
        zone_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE kiosks SET zone_id = ? WHERE kiosk_id = ?")
            .bind(zone_id)
            .bind(kiosk_id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_write("kiosks", &e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { entity: "kiosks" });
        }
        Ok(())
    }

    /// Force a kiosk into a status (maintenance, error, ...).
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the kiosk does not exist.
    /// - [`StoreError::Write`] on other failures.
    pub async fn set_kiosk_status(
        &self,
        kiosk_id: &str,
        status: KioskStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE kiosks SET status = ? WHERE kiosk_id = ?")
            .bind(status)
            .bind(kiosk_id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_write("kiosks", &e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { entity: "kiosks" });
        }
        Ok(())
    }

    /// Per-zone, per-status kiosk counts. Kiosks without a zone group under
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn kiosk_status_counts(
        &self,
    ) -> Result<Vec<(Option<String>, KioskStatus, i64)>, StoreError> {
        sqlx::query_as(
            "SELECT zone_id, status, COUNT(*) FROM kiosks \
             GROUP BY zone_id, status ORDER BY zone_id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "kiosks",
            reason: e.to_string(),
        })
    }

    /// Append a telemetry sample for a kiosk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the insert fails.
    pub async fn insert_telemetry(
        &self,
        kiosk_id: &str,
        sample: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO telemetry_samples (kiosk_id, sample, created_at) VALUES (?, ?, ?)")
            .bind(kiosk_id)
            .bind(sample)
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_write("telemetry_samples", &e))?;

        Ok(())
    }

    /// Latest telemetry samples for a kiosk, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn telemetry_for_kiosk(
        &self,
        kiosk_id: &str,
        limit: i64,
    ) -> Result<Vec<TelemetrySampleRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM telemetry_samples WHERE kiosk_id = ? \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(kiosk_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "telemetry_samples",
            reason: e.to_string(),
        })
    }

    /// Delete telemetry samples older than `cutoff`. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the delete fails.
    pub async fn prune_telemetry(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM telemetry_samples WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_write("telemetry_samples", &e))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_creates_then_updates() {
        let store = crate::test_store().await;
        let now = Utc::now();

        let k = store
            .kiosk_heartbeat("K1", "1.2.0", None, None, now)
            .await
            .unwrap();
        assert_eq!(k.status, KioskStatus::Online);
        assert_eq!(k.version.as_deref(), Some("1.2.0"));

        let k = store
            .kiosk_heartbeat("K1", "1.3.0", None, Some("abc"), now)
            .await
            .unwrap();
        assert_eq!(k.version.as_deref(), Some("1.3.0"));
        assert_eq!(k.config_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn heartbeat_does_not_leave_maintenance() {
        let store = crate::test_store().await;
        let now = Utc::now();
        store
            .kiosk_heartbeat("K1", "1.0.0", None, None, now)
            .await
            .unwrap();
        store
            .set_kiosk_status("K1", KioskStatus::Maintenance)
            .await
            .unwrap();

        let k = store
            .kiosk_heartbeat("K1", "1.0.0", None, None, now)
            .await
            .unwrap();
        assert_eq!(k.status, KioskStatus::Maintenance);
    }

    #[tokio::test]
    async fn offline_sweep_flips_only_stale_kiosks() {
        let store = crate::test_store().await;
        let now = Utc::now();

        store
            .kiosk_heartbeat("stale", "1.0.0", None, None, now - chrono::Duration::seconds(120))
            .await
            .unwrap();
        store
            .kiosk_heartbeat("fresh", "1.0.0", None, None, now)
            .await
            .unwrap();

        let flipped = store
            .kiosks_mark_offline(now - chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(flipped, vec!["stale".to_owned()]);

        let fresh = store.kiosk("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, KioskStatus::Online);
    }

    #[tokio::test]
    async fn telemetry_prune_removes_old_samples() {
        let store = crate::test_store().await;
        let now = Utc::now();

        store
            .insert_telemetry("K1", "{\"cpu\":10}", now - chrono::Duration::days(8))
            .await
            .unwrap();
        store
            .insert_telemetry("K1", "{\"cpu\":20}", now)
            .await
            .unwrap();

        let removed = store
            .prune_telemetry(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let left = store.telemetry_for_kiosk("K1", 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].sample, "{\"cpu\":20}");
    }
}
