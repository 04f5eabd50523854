//! VIP contract rows.
//!
//! Two partial unique indexes guarantee at most one active contract per
//! locker and per card, so the application-level checks in `lockerd-core`
//! are backstopped at the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::Store;

/// VIP contract lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContractStatus {
    Active,
    Expired,
    Cancelled,
    Transferred,
}

/// One VIP contract row. `rfid_card` is the salted hash, never the raw id.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VipContractRow {
    pub contract_id: String,
    pub kiosk_id: String,
    pub locker_id: i64,
    pub rfid_card: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub status: ContractStatus,
    pub plan: Option<String>,
    pub transfer_to_card: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Insert a new active contract.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Constraint`] if the locker or card already has an
    ///   active contract.
    /// - [`StoreError::Write`] on other failures.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_vip_contract(
        &self,
        contract_id: &str,
        kiosk_id: &str,
        locker_id: i64,
        rfid_card: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        plan: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<VipContractRow, StoreError> {
        let row: Option<VipContractRow> = sqlx::query_as(
            "INSERT INTO vip_contracts \
                 (contract_id, kiosk_id, locker_id, rfid_card, start_date, end_date, \
                  status, plan, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'active', ?, ?, ?) RETURNING *",
        )
        .bind(contract_id)
        .bind(kiosk_id)
        .bind(locker_id)
        .bind(rfid_card)
        .bind(start_date)
        .bind(end_date)
        .bind(plan)
        .bind(now)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("vip_contracts", &e))?;

        row.ok_or(StoreError::Write {
            entity: "vip_contracts",
            reason: "insert returned no row".to_owned(),
        })
    }

    /// Fetch a contract by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn vip_contract(
        &self,
        contract_id: &str,
    ) -> Result<Option<VipContractRow>, StoreError> {
        sqlx::query_as("SELECT * FROM vip_contracts WHERE contract_id = ?")
            .bind(contract_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "vip_contracts",
                reason: e.to_string(),
            })
    }

    /// The active contract for a locker, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn active_vip_for_locker(
        &self,
        kiosk_id: &str,
        locker_id: i64,
    ) -> Result<Option<VipContractRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM vip_contracts \
             WHERE kiosk_id = ? AND locker_id = ? AND status = 'active'",
        )
        .bind(kiosk_id)
        .bind(locker_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "vip_contracts",
            reason: e.to_string(),
        })
    }

    /// The active contract for a card, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn active_vip_for_card(
        &self,
        rfid_card: &str,
    ) -> Result<Option<VipContractRow>, StoreError> {
        sqlx::query_as("SELECT * FROM vip_contracts WHERE rfid_card = ? AND status = 'active'")
            .bind(rfid_card)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "vip_contracts",
                reason: e.to_string(),
            })
    }

    /// All contracts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn all_vip_contracts(&self) -> Result<Vec<VipContractRow>, StoreError> {
        sqlx::query_as("SELECT * FROM vip_contracts ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "vip_contracts",
                reason: e.to_string(),
            })
    }

    /// Move a contract from one status to another. Returns `None` when the
    /// contract is not currently in `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn set_vip_status(
        &self,
        contract_id: &str,
        from: ContractStatus,
        to: ContractStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<VipContractRow>, StoreError> {
        sqlx::query_as(
            "UPDATE vip_contracts SET status = ?, updated_at = ? \
             WHERE contract_id = ? AND status = ? RETURNING *",
        )
        .bind(to)
        .bind(now)
        .bind(contract_id)
        .bind(from)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("vip_contracts", &e))
    }

    /// Extend an active contract's end date.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn extend_vip_contract(
        &self,
        contract_id: &str,
        new_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<VipContractRow>, StoreError> {
        sqlx::query_as(
            "UPDATE vip_contracts SET end_date = ?, updated_at = ? \
             WHERE contract_id = ? AND status = 'active' RETURNING *",
        )
        .bind(new_end)
        .bind(now)
        .bind(contract_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("vip_contracts", &e))
    }

    /// Set or clear the pending transfer target on an active contract.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn set_vip_transfer_target(
        &self,
        contract_id: &str,
        to_card: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<VipContractRow>, StoreError> {
        sqlx::query_as(
            "UPDATE vip_contracts SET transfer_to_card = ?, updated_at = ? \
             WHERE contract_id = ? AND status = 'active' RETURNING *",
        )
        .bind(to_card)
        .bind(now)
        .bind(contract_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("vip_contracts", &e))
    }

    /// Active contracts whose end date has passed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn expired_vip_contracts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<VipContractRow>, StoreError> {
        sqlx::query_as("SELECT * FROM vip_contracts WHERE status = 'active' AND end_date < ?")
            .bind(now)
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "vip_contracts",
                reason: e.to_string(),
            })
    }
}
