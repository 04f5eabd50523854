//! Locker rows: ownership state, optimistic versioning.
//!
//! A locker is keyed by `(kiosk_id, id)`. Every mutation goes through
//! [`Store::locker_cas_update`], which bumps `version` and fails with
//! [`StoreError::Conflict`] when the caller's observed version is stale.
//! The partial unique index `idx_lockers_rfid_owner` backstops the
//! one-locker-per-card rule at the database level, so two racing assigns
//! can never both commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::Store;

/// Locker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LockerStatus {
    Free,
    Owned,
    Reserved,
    Blocked,
}

impl LockerStatus {
    /// Stable lowercase name, as stored and as serialized.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Owned => "owned",
            Self::Reserved => "reserved",
            Self::Blocked => "blocked",
        }
    }
}

/// Kind of owner currently holding a locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OwnerType {
    Rfid,
    Device,
    Vip,
}

/// One locker row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LockerRow {
    pub kiosk_id: String,
    pub id: i64,
    pub status: LockerStatus,
    pub owner_type: Option<OwnerType>,
    pub owner_key: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub owned_at: Option<DateTime<Utc>>,
    pub is_vip: bool,
    pub blocked_reason: Option<String>,
    pub version: i64,
}

/// Target state for a compare-and-set locker update.
///
/// `version` is never set by the caller; the update always writes
/// `version + 1`.
#[derive(Debug, Clone)]
pub struct LockerMutation {
    pub status: LockerStatus,
    pub owner_type: Option<OwnerType>,
    pub owner_key: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub owned_at: Option<DateTime<Utc>>,
    pub is_vip: bool,
    pub blocked_reason: Option<String>,
}

impl Store {
    /// Ensure rows `1..=count` exist for a kiosk, creating missing ones as
    /// `free`. Idempotent; never shrinks an existing kiosk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if an insert fails.
    pub async fn sync_lockers(&self, kiosk_id: &str, count: i64) -> Result<u64, StoreError> {
        let mut created = 0u64;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::Write {
                entity: "lockers",
                reason: e.to_string(),
            })?;

        for id in 1..=count {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO lockers (kiosk_id, id) VALUES (?, ?)",
            )
            .bind(kiosk_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write("lockers", &e))?;
            created += result.rows_affected();
        }

        tx.commit().await.map_err(|e| StoreError::Write {
            entity: "lockers",
            reason: e.to_string(),
        })?;

        Ok(created)
    }

    /// Fetch one locker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn locker(
        &self,
        kiosk_id: &str,
        id: i64,
    ) -> Result<Option<LockerRow>, StoreError> {
        sqlx::query_as("SELECT * FROM lockers WHERE kiosk_id = ? AND id = ?")
            .bind(kiosk_id)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "lockers",
                reason: e.to_string(),
            })
    }

    /// All lockers of a kiosk, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn lockers_for_kiosk(&self, kiosk_id: &str) -> Result<Vec<LockerRow>, StoreError> {
        sqlx::query_as("SELECT * FROM lockers WHERE kiosk_id = ? ORDER BY id")
            .bind(kiosk_id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "lockers",
                reason: e.to_string(),
            })
    }

    /// Free, non-VIP lockers of a kiosk, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn available_lockers(&self, kiosk_id: &str) -> Result<Vec<LockerRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM lockers \
             WHERE kiosk_id = ? AND status = 'free' AND is_vip = 0 \
             ORDER BY id",
        )
        .bind(kiosk_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "lockers",
            reason: e.to_string(),
        })
    }

    /// Find the locker currently held (reserved or owned) by an owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn locker_by_owner(
        &self,
        owner_type: OwnerType,
        owner_key: &str,
    ) -> Result<Option<LockerRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM lockers \
             WHERE owner_type = ? AND owner_key = ? AND status IN ('reserved', 'owned') \
             LIMIT 1",
        )
        .bind(owner_type)
        .bind(owner_key)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "lockers",
            reason: e.to_string(),
        })
    }

    /// All rows with a given locker id, across kiosks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn lockers_by_id(&self, id: i64) -> Result<Vec<LockerRow>, StoreError> {
        sqlx::query_as("SELECT * FROM lockers WHERE id = ? ORDER BY kiosk_id")
            .bind(id)
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "lockers",
                reason: e.to_string(),
            })
    }

    /// Compare-and-set update of one locker.
    ///
    /// Writes the mutation and `version + 1` only if the row still carries
    /// `expected_version`. Returns the updated row.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Conflict`] if the version was stale (or row missing).
    /// - [`StoreError::Constraint`] if the rfid owner uniqueness index
    ///   rejected the write.
    /// - [`StoreError::Write`] on other database failures.
    pub async fn locker_cas_update(
        &self,
        kiosk_id: &str,
        id: i64,
        expected_version: i64,
        mutation: &LockerMutation,
    ) -> Result<LockerRow, StoreError> {
        let row: Option<LockerRow> = sqlx::query_as(
            "UPDATE lockers SET \
                 status = ?, owner_type = ?, owner_key = ?, \
                 reserved_at = ?, owned_at = ?, is_vip = ?, blocked_reason = ?, \
                 version = version + 1 \
             WHERE kiosk_id = ? AND id = ? AND version = ? \
             RETURNING *",
        )
        .bind(mutation.status)
        .bind(mutation.owner_type)
        .bind(mutation.owner_key.as_deref())
        .bind(mutation.reserved_at)
        .bind(mutation.owned_at)
        .bind(mutation.is_vip)
        .bind(mutation.blocked_reason.as_deref())
        .bind(kiosk_id)
        .bind(id)
        .bind(expected_version)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("lockers", &e))?;

        row.ok_or(StoreError::Conflict { entity: "lockers" })
    }

    /// Reserved lockers whose reservation is older than `cutoff`.
    ///
    /// The caller releases each row through the normal CAS path so version
    /// monotonicity holds and per-row events can be emitted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn expired_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LockerRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM lockers WHERE status = 'reserved' AND reserved_at < ? \
             ORDER BY kiosk_id, id",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "lockers",
            reason: e.to_string(),
        })
    }
}
