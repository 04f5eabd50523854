//! Kiosk command queue.
//!
//! A durable FIFO per kiosk with at-least-once delivery. Kiosks poll for
//! work, execute it, and report completion; a failed attempt goes back to
//! `pending` with exponential backoff until `max_attempts`, then
//! dead-letters as `failed`. At most one command per kiosk is ever in
//! flight: a poll while one is outstanding re-delivers that command, so a
//! kiosk that restarted mid-command can safely resume.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lockerd_store::{CommandRow, Store};

use crate::error::QueueError;

/// Typed payload of a queued command. Serialized as tagged JSON in the
/// `payload` column; the tag doubles as the `command_type` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    /// Open one locker (optionally with a burst for a stuck latch).
    OpenLocker {
        locker_id: i64,
        #[serde(default)]
        burst: bool,
    },
    /// Open a list of lockers sequentially.
    BulkOpen {
        locker_ids: Vec<i64>,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    /// Fetch and apply a config version.
    ApplyConfig { version: i64, hash: String },
    /// Drop any kiosk-local ownership cache for a locker.
    ClearOwnership { locker_id: i64 },
}

impl CommandPayload {
    /// The stable type tag, as stored in `command_type`.
    #[must_use]
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::OpenLocker { .. } => "open_locker",
            Self::BulkOpen { .. } => "bulk_open",
            Self::ApplyConfig { .. } => "apply_config",
            Self::ClearOwnership { .. } => "clear_ownership",
        }
    }
}

/// Retry policy for failed deliveries.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: i64,
    /// First redelivery delay; doubles per attempt.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(480),
        }
    }
}

/// Durable per-kiosk command FIFO.
pub struct CommandQueue {
    store: Store,
    settings: QueueSettings,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue").finish_non_exhaustive()
    }
}

impl CommandQueue {
    #[must_use]
    pub fn new(store: Store, settings: QueueSettings) -> Self {
        Self { store, settings }
    }

    /// Queue a command for a kiosk. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the insert fails.
    pub async fn enqueue(
        &self,
        kiosk_id: &str,
        payload: &CommandPayload,
    ) -> Result<CommandRow, QueueError> {
        let command_id = uuid::Uuid::new_v4().to_string();
        let json = serde_json::to_string(payload).map_err(|e| QueueError::BadPayload {
            reason: e.to_string(),
        })?;

        let row = self
            .store
            .enqueue_command(&command_id, kiosk_id, payload.command_type(), &json, Utc::now())
            .await?;

        info!(kiosk_id, command_id = %row.command_id, command_type = %row.command_type, "command enqueued");
        Ok(row)
    }

    /// Claim work for a kiosk.
    ///
    /// Re-delivers the in-flight command if one exists (kiosks may re-poll
    /// after a restart); otherwise atomically claims the oldest eligible
    /// pending command. `limit` bounds the result; at most one command is
    /// in flight per kiosk at any time.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the claim fails.
    pub async fn poll(&self, kiosk_id: &str, limit: u32) -> Result<Vec<CommandRow>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        if let Some(in_flight) = self.store.in_flight_command(kiosk_id).await? {
            return Ok(vec![in_flight]);
        }

        Ok(self
            .store
            .claim_next_command(kiosk_id, Utc::now())
            .await?
            .into_iter()
            .collect())
    }

    /// Report the outcome of an in-flight command.
    ///
    /// Failures requeue with exponential backoff while attempts remain,
    /// then dead-letter.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for unknown ids.
    /// - [`QueueError::NotInFlight`] if the command is not in flight.
    pub async fn complete(
        &self,
        command_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<CommandRow, QueueError> {
        let now = Utc::now();

        if success {
            return match self.store.complete_command(command_id, now).await? {
                Some(row) => {
                    info!(command_id, kiosk_id = %row.kiosk_id, "command completed");
                    Ok(row)
                }
                None => Err(self.not_in_flight(command_id).await?),
            };
        }

        let current = self
            .store
            .command(command_id)
            .await?
            .ok_or_else(|| QueueError::NotFound {
                command_id: command_id.to_owned(),
            })?;

        let attempts_after = current.attempts + 1;
        let next_attempt = if attempts_after < self.settings.max_attempts {
            let exponent = u32::try_from(current.attempts).unwrap_or(0).min(16);
            let backoff = self
                .settings
                .backoff_base
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.settings.backoff_cap);
            Some(now + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(30)))
        } else {
            None
        };

        match self
            .store
            .fail_command(command_id, error.unwrap_or("unspecified"), now, next_attempt)
            .await?
        {
            Some(row) => {
                if next_attempt.is_some() {
                    warn!(command_id, attempts = row.attempts, "command failed, requeued");
                } else {
                    warn!(command_id, attempts = row.attempts, "command dead-lettered");
                }
                Ok(row)
            }
            None => Err(self.not_in_flight(command_id).await?),
        }
    }

    /// Distinguish "unknown id" from "not in flight" for error reporting.
    async fn not_in_flight(&self, command_id: &str) -> Result<QueueError, QueueError> {
        Ok(match self.store.command(command_id).await? {
            Some(_) => QueueError::NotInFlight {
                command_id: command_id.to_owned(),
            },
            None => QueueError::NotFound {
                command_id: command_id.to_owned(),
            },
        })
    }

    /// Drop all pending commands for a kiosk (invoked on kiosk restart to
    /// discard stale bulk opens). Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Store`] if the delete fails.
    pub async fn clear_pending(&self, kiosk_id: &str) -> Result<u64, QueueError> {
        let removed = self.store.clear_pending_commands(kiosk_id).await?;
        if removed > 0 {
            info!(kiosk_id, removed, "pending commands cleared");
        }
        Ok(removed)
    }

    /// Cancel a pending command. In-flight commands cannot be cancelled;
    /// the kiosk must complete them first.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NotFound`] for unknown ids.
    /// - [`QueueError::NotPending`] if the command is already in flight or
    ///   finished.
    pub async fn cancel(&self, command_id: &str) -> Result<(), QueueError> {
        if self.store.cancel_pending_command(command_id).await? {
            info!(command_id, "command cancelled");
            return Ok(());
        }
        match self.store.command(command_id).await? {
            Some(_) => Err(QueueError::NotPending {
                command_id: command_id.to_owned(),
            }),
            None => Err(QueueError::NotFound {
                command_id: command_id.to_owned(),
            }),
        }
    }

    /// Decode a row's payload.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::BadPayload`] if the stored JSON is invalid.
    pub fn payload(row: &CommandRow) -> Result<CommandPayload, QueueError> {
        serde_json::from_str(&row.payload).map_err(|e| QueueError::BadPayload {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockerd_store::CommandStatus;

    async fn queue() -> CommandQueue {
        let store = Store::open_in_memory().await.unwrap();
        CommandQueue::new(store, QueueSettings::default())
    }

    #[tokio::test]
    async fn payload_round_trips_through_the_row() {
        let q = queue().await;
        let payload = CommandPayload::BulkOpen {
            locker_ids: vec![1, 2, 3],
            interval_ms: Some(500),
        };

        let row = q.enqueue("K1", &payload).await.unwrap();
        assert_eq!(row.command_type, "bulk_open");
        assert_eq!(CommandQueue::payload(&row).unwrap(), payload);
    }

    #[tokio::test]
    async fn poll_redelivers_the_in_flight_command() {
        let q = queue().await;
        q.enqueue("K1", &CommandPayload::OpenLocker { locker_id: 5, burst: false })
            .await
            .unwrap();

        let first = q.poll("K1", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        // Kiosk restarts and polls again: same command, still in flight.
        let again = q.poll("K1", 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].command_id, first[0].command_id);
        assert_eq!(again[0].status, CommandStatus::InFlight);
    }

    #[tokio::test]
    async fn delivery_is_fifo_one_at_a_time() {
        let q = queue().await;
        let a = q
            .enqueue("K1", &CommandPayload::OpenLocker { locker_id: 1, burst: false })
            .await
            .unwrap();
        let b = q
            .enqueue("K1", &CommandPayload::OpenLocker { locker_id: 2, burst: false })
            .await
            .unwrap();

        let polled = q.poll("K1", 10).await.unwrap();
        assert_eq!(polled[0].command_id, a.command_id);

        q.complete(&a.command_id, true, None).await.unwrap();
        let polled = q.poll("K1", 10).await.unwrap();
        assert_eq!(polled[0].command_id, b.command_id);
    }

    #[tokio::test]
    async fn failures_requeue_then_dead_letter() {
        let q = queue().await;
        let row = q
            .enqueue("K1", &CommandPayload::OpenLocker { locker_id: 1, burst: false })
            .await
            .unwrap();

        // Attempt 1 fails: requeued with backoff.
        q.poll("K1", 1).await.unwrap();
        let after = q.complete(&row.command_id, false, Some("relay timeout")).await.unwrap();
        assert_eq!(after.status, CommandStatus::Pending);
        assert_eq!(after.attempts, 1);
        assert!(after.next_attempt_at.is_some());

        // Backing off: nothing claimable right now.
        assert!(q.poll("K1", 1).await.unwrap().is_empty());

        // Fast-forward by clearing the backoff, then burn the remaining attempts.
        for expected_attempts in 2..=3 {
            sqlx::query("UPDATE commands SET next_attempt_at = NULL WHERE command_id = ?")
                .bind(&row.command_id)
                .execute(q.store.pool())
                .await
                .unwrap();
            q.poll("K1", 1).await.unwrap();
            let after = q
                .complete(&row.command_id, false, Some("relay timeout"))
                .await
                .unwrap();
            assert_eq!(after.attempts, expected_attempts);
            if expected_attempts == 3 {
                assert_eq!(after.status, CommandStatus::Failed);
                assert_eq!(after.last_error.as_deref(), Some("relay timeout"));
            } else {
                assert_eq!(after.status, CommandStatus::Pending);
            }
        }
    }

    #[tokio::test]
    async fn completing_a_pending_command_is_rejected() {
        let q = queue().await;
        let row = q
            .enqueue("K1", &CommandPayload::OpenLocker { locker_id: 1, burst: false })
            .await
            .unwrap();

        let err = q.complete(&row.command_id, true, None).await.unwrap_err();
        assert!(matches!(err, QueueError::NotInFlight { .. }));

        let err = q.complete("no-such-id", true, None).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_only_works_while_pending() {
        let q = queue().await;
        let row = q
            .enqueue("K1", &CommandPayload::OpenLocker { locker_id: 1, burst: false })
            .await
            .unwrap();

        q.poll("K1", 1).await.unwrap();
        let err = q.cancel(&row.command_id).await.unwrap_err();
        assert!(matches!(err, QueueError::NotPending { .. }));
    }
}
