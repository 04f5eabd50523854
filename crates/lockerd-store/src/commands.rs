//! Durable per-kiosk command queue rows.
//!
//! FIFO ordering comes from the `seq` rowid. The claim statement is a single
//! UPDATE whose subselect both picks the oldest eligible pending command and
//! verifies no command is already in flight for the kiosk, so the
//! pending → in-flight transition is atomic per kiosk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::Store;

/// Delivery status of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// One queued command row. `payload` is the JSON-encoded typed payload
/// defined in `lockerd-core`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommandRow {
    pub seq: i64,
    pub command_id: String,
    pub kiosk_id: String,
    pub command_type: String,
    pub payload: String,
    pub status: CommandStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub picked_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Append a pending command for a kiosk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the insert fails.
    pub async fn enqueue_command(
        &self,
        command_id: &str,
        kiosk_id: &str,
        command_type: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<CommandRow, StoreError> {
        let row: Option<CommandRow> = sqlx::query_as(
            "INSERT INTO commands (command_id, kiosk_id, command_type, payload, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(command_id)
        .bind(kiosk_id)
        .bind(command_type)
        .bind(payload)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("commands", &e))?;

        row.ok_or(StoreError::Write {
            entity: "commands",
            reason: "enqueue returned no row".to_owned(),
        })
    }

    /// Fetch a command by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn command(&self, command_id: &str) -> Result<Option<CommandRow>, StoreError> {
        sqlx::query_as("SELECT * FROM commands WHERE command_id = ?")
            .bind(command_id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| StoreError::Query {
                entity: "commands",
                reason: e.to_string(),
            })
    }

    /// The command currently in flight for a kiosk, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Query`] if the read fails.
    pub async fn in_flight_command(
        &self,
        kiosk_id: &str,
    ) -> Result<Option<CommandRow>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM commands WHERE kiosk_id = ? AND status = 'in_flight' \
             ORDER BY seq LIMIT 1",
        )
        .bind(kiosk_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::Query {
            entity: "commands",
            reason: e.to_string(),
        })
    }

    /// Atomically claim the oldest eligible pending command for a kiosk.
    ///
    /// Claims nothing when a command is already in flight (the subselect's
    /// `NOT EXISTS` guard) or when pending commands are still backing off.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn claim_next_command(
        &self,
        kiosk_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CommandRow>, StoreError> {
        sqlx::query_as(
            "UPDATE commands SET status = 'in_flight', picked_at = ? \
             WHERE status = 'pending' AND seq = (\
                 SELECT seq FROM commands c \
                 WHERE c.kiosk_id = ? AND c.status = 'pending' \
                   AND (c.next_attempt_at IS NULL OR c.next_attempt_at <= ?) \
                   AND NOT EXISTS (\
                       SELECT 1 FROM commands f \
                       WHERE f.kiosk_id = c.kiosk_id AND f.status = 'in_flight'\
                   ) \
                 ORDER BY c.seq LIMIT 1\
             ) \
             RETURNING *",
        )
        .bind(now)
        .bind(kiosk_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("commands", &e))
    }

    /// Mark an in-flight command completed.
    ///
    /// Returns `None` if the command is not in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn complete_command(
        &self,
        command_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CommandRow>, StoreError> {
        sqlx::query_as(
            "UPDATE commands SET status = 'completed', completed_at = ? \
             WHERE command_id = ? AND status = 'in_flight' RETURNING *",
        )
        .bind(now)
        .bind(command_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StoreError::from_write("commands", &e))
    }

    /// Record a failed delivery attempt.
    ///
    /// With `next_attempt` set the command goes back to `pending` for a
    /// later retry; without it the command dead-letters as `failed`.
    /// Returns `None` if the command is not in flight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the update fails.
    pub async fn fail_command(
        &self,
        command_id: &str,
        error: &str,
        now: DateTime<Utc>,
        next_attempt: Option<DateTime<Utc>>,
    ) -> Result<Option<CommandRow>, StoreError> {
        let row: Option<CommandRow> = if let Some(next) = next_attempt {
            sqlx::query_as(
                "UPDATE commands SET \
                     status = 'pending', attempts = attempts + 1, last_error = ?, \
                     picked_at = NULL, next_attempt_at = ? \
                 WHERE command_id = ? AND status = 'in_flight' RETURNING *",
            )
            .bind(error)
            .bind(next)
            .bind(command_id)
            .fetch_optional(self.pool())
            .await
        } else {
            sqlx::query_as(
                "UPDATE commands SET \
                     status = 'failed', attempts = attempts + 1, last_error = ?, \
                     completed_at = ? \
                 WHERE command_id = ? AND status = 'in_flight' RETURNING *",
            )
            .bind(error)
            .bind(now)
            .bind(command_id)
            .fetch_optional(self.pool())
            .await
        }
        .map_err(|e| StoreError::from_write("commands", &e))?;

        Ok(row)
    }

    /// Delete all pending commands for a kiosk (invoked on kiosk restart).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the delete fails.
    pub async fn clear_pending_commands(&self, kiosk_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM commands WHERE kiosk_id = ? AND status = 'pending'")
            .bind(kiosk_id)
            .execute(self.pool())
            .await
            .map_err(|e| StoreError::from_write("commands", &e))?;

        Ok(result.rows_affected())
    }

    /// Cancel a pending command. Returns `false` if the command was not
    /// pending (in-flight commands must be completed by the kiosk first).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the delete fails.
    pub async fn cancel_pending_command(&self, command_id: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM commands WHERE command_id = ? AND status = 'pending'")
                .bind(command_id)
                .execute(self.pool())
                .await
                .map_err(|e| StoreError::from_write("commands", &e))?;

        Ok(result.rows_affected() > 0)
    }
}
