//! Append-only audit log.
//!
//! Card identifiers are HMAC-SHA256'd with a per-installation salt before
//! they reach storage, so audit entries can be correlated without ever
//! exposing a raw card id. The salt is generated on first boot and persisted
//! in the `meta` table, keeping hashes stable across restarts.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use lockerd_store::{EventFilter, EventRow, NewEvent, Store};

use crate::error::EventError;

type HmacSha256 = Hmac<Sha256>;

const SALT_META_KEY: &str = "event_salt";

/// Audit event writer/reader with stable salted hashing of personal ids.
pub struct EventLogger {
    store: Store,
    salt: Vec<u8>,
}

impl std::fmt::Debug for EventLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogger")
            .field("salt", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl EventLogger {
    /// Load the salt from the store, generating and persisting one on first
    /// boot.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Store`] if the meta table cannot be accessed.
    pub async fn init(store: Store) -> Result<Self, EventError> {
        let salt = match store.meta_get(SALT_META_KEY).await? {
            Some(hex_salt) => hex::decode(&hex_salt).unwrap_or_else(|_| hex_salt.into_bytes()),
            None => {
                // Two UUID v4s = 32 bytes of OS CSPRNG randomness.
                let a = uuid::Uuid::new_v4();
                let b = uuid::Uuid::new_v4();
                let mut salt = Vec::with_capacity(32);
                salt.extend_from_slice(a.as_bytes());
                salt.extend_from_slice(b.as_bytes());
                store.meta_put(SALT_META_KEY, &hex::encode(&salt)).await?;
                salt
            }
        };

        Ok(Self { store, salt })
    }

    /// Hash a card id for storage. Hex HMAC-SHA256 under the installation
    /// salt; stable for the lifetime of the database.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn hash_card(&self, raw: &str) -> String {
        #[allow(clippy::unwrap_used)]
        // HMAC-SHA256 accepts any key length per RFC 2104, so this never fails.
        let mut mac = HmacSha256::new_from_slice(&self.salt).unwrap();
        mac.update(raw.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Append one audit event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Store`] if the insert fails.
    pub async fn log(
        &self,
        kiosk_id: &str,
        locker_id: Option<i64>,
        event_type: &str,
        actor: &str,
        details: serde_json::Value,
    ) -> Result<(), EventError> {
        self.store
            .insert_event(
                &NewEvent {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id,
                    event_type: event_type.to_owned(),
                    actor: actor.to_owned(),
                    details,
                },
                chrono::Utc::now(),
            )
            .await?;
        Ok(())
    }

    /// Append an event, downgrading failures to a warning.
    ///
    /// Used after a state mutation has already committed: the transition
    /// cannot be rolled back, so a failed audit write must not fail the
    /// operation.
    pub async fn log_or_warn(
        &self,
        kiosk_id: &str,
        locker_id: Option<i64>,
        event_type: &str,
        actor: &str,
        details: serde_json::Value,
    ) {
        if let Err(e) = self.log(kiosk_id, locker_id, event_type, actor, details).await {
            warn!(
                kiosk_id,
                locker_id,
                event_type,
                error = %e,
                "failed to write audit event"
            );
        }
    }

    /// Query events matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Store`] if the read fails.
    pub async fn query(&self, filter: &EventFilter) -> Result<Vec<EventRow>, EventError> {
        Ok(self.store.events(filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_is_stable_across_restarts() {
        let store = Store::open_in_memory().await.unwrap();

        let logger = EventLogger::init(store.clone()).await.unwrap();
        let first = logger.hash_card("04:A3:22:91");

        // A second logger over the same store must produce the same hash.
        let again = EventLogger::init(store).await.unwrap();
        assert_eq!(again.hash_card("04:A3:22:91"), first);
        assert_ne!(again.hash_card("04:A3:22:92"), first);
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn different_stores_hash_differently() {
        let a = EventLogger::init(Store::open_in_memory().await.unwrap())
            .await
            .unwrap();
        let b = EventLogger::init(Store::open_in_memory().await.unwrap())
            .await
            .unwrap();
        assert_ne!(a.hash_card("04:A3:22:91"), b.hash_card("04:A3:22:91"));
    }

    #[tokio::test]
    async fn events_are_queryable_after_logging() {
        let store = Store::open_in_memory().await.unwrap();
        let logger = EventLogger::init(store).await.unwrap();

        logger
            .log(
                "K1",
                Some(5),
                "locker_released",
                "system",
                serde_json::json!({ "owner": logger.hash_card("card") }),
            )
            .await
            .unwrap();

        let rows = logger
            .query(&EventFilter {
                event_type: Some("locker_released".to_owned()),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].locker_id, Some(5));
        assert!(!rows[0].details.contains("card\""));
    }
}
