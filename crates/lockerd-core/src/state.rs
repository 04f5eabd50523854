//! Locker ownership state machine.
//!
//! The only component that mutates locker rows. Every transition re-reads
//! the row, decides, and commits through a compare-and-set on `version`;
//! a lost race re-reads and retries a bounded number of times before
//! surfacing a conflict. Owner keys arriving here are already salted
//! hashes; raw card ids never reach this module.
//!
//! VIP lockers never pass through `Reserved` and are immune to everything
//! except an explicit unbind or a forced release/block.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use lockerd_store::{
    LockerMutation, LockerRow, LockerStatus, OwnerType, Store, StoreError,
};

use crate::error::StateError;
use crate::events::EventLogger;
use crate::zones::Zone;

/// Retries per operation when the CAS loses a race.
const CAS_RETRIES: u32 = 3;

/// Who holds a locker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// An RFID card, by salted hash.
    Rfid(String),
    /// A kiosk-local device binding (e.g. wristband terminal).
    Device(String),
    /// A VIP card under contract, by salted hash.
    Vip(String),
}

impl Owner {
    #[must_use]
    pub fn owner_type(&self) -> OwnerType {
        match self {
            Self::Rfid(_) => OwnerType::Rfid,
            Self::Device(_) => OwnerType::Device,
            Self::Vip(_) => OwnerType::Vip,
        }
    }

    /// The (hashed) owner key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Rfid(k) | Self::Device(k) | Self::Vip(k) => k,
        }
    }

    /// Whether this owner is the one recorded on a row.
    #[must_use]
    pub fn matches(&self, row: &LockerRow) -> bool {
        row.owner_type == Some(self.owner_type()) && row.owner_key.as_deref() == Some(self.key())
    }
}

fn freed(row: &LockerRow) -> LockerMutation {
    LockerMutation {
        status: LockerStatus::Free,
        owner_type: None,
        owner_key: None,
        reserved_at: None,
        owned_at: None,
        is_vip: row.is_vip,
        blocked_reason: None,
    }
}

/// The authoritative ownership state machine.
pub struct StateManager {
    store: Store,
    events: Arc<EventLogger>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager").finish_non_exhaustive()
    }
}

impl StateManager {
    #[must_use]
    pub fn new(store: Store, events: Arc<EventLogger>) -> Self {
        Self { store, events }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn events(&self) -> &Arc<EventLogger> {
        &self.events
    }

    /// Create locker rows `1..=count` for a kiosk (first sync). Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Store`] if the writes fail.
    pub async fn sync_lockers(&self, kiosk_id: &str, count: i64) -> Result<u64, StateError> {
        let created = self.store.sync_lockers(kiosk_id, count).await?;
        if created > 0 {
            info!(kiosk_id, created, "locker rows synced");
        }
        Ok(created)
    }

    /// The locker currently held by an owner, if any. Uses the
    /// one-locker-per-card rule, so at most one row can match.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Store`] if the read fails.
    pub async fn existing_ownership(&self, owner: &Owner) -> Result<Option<LockerRow>, StateError> {
        Ok(self
            .store
            .locker_by_owner(owner.owner_type(), owner.key())
            .await?)
    }

    /// Free, non-VIP lockers of a kiosk, optionally narrowed to a zone's
    /// ranges, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Store`] if the read fails.
    pub async fn available(
        &self,
        kiosk_id: &str,
        zone: Option<&Zone>,
    ) -> Result<Vec<LockerRow>, StateError> {
        let mut lockers = self.store.available_lockers(kiosk_id).await?;
        if let Some(zone) = zone {
            lockers.retain(|l| zone.contains(l.id));
        }
        Ok(lockers)
    }

    /// All lockers of a kiosk regardless of status, optionally narrowed to
    /// a zone.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Store`] if the read fails.
    pub async fn all(
        &self,
        kiosk_id: &str,
        zone: Option<&Zone>,
    ) -> Result<Vec<LockerRow>, StateError> {
        let mut lockers = self.store.lockers_for_kiosk(kiosk_id).await?;
        if let Some(zone) = zone {
            lockers.retain(|l| zone.contains(l.id));
        }
        Ok(lockers)
    }

    /// Fetch one locker row.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFound`] if the row does not exist.
    pub async fn locker(&self, kiosk_id: &str, locker_id: i64) -> Result<LockerRow, StateError> {
        self.store
            .locker(kiosk_id, locker_id)
            .await?
            .ok_or_else(|| StateError::NotFound {
                kiosk_id: kiosk_id.to_owned(),
                locker_id,
            })
    }

    /// Reserve a free, non-VIP locker for an owner.
    ///
    /// Idempotent: re-assigning a locker already reserved by the same owner
    /// is a no-op success.
    ///
    /// # Errors
    ///
    /// - [`StateError::OwnerHoldsAnother`] if the owner already holds a
    ///   different locker.
    /// - [`StateError::Busy`] / [`StateError::Blocked`] for unassignable
    ///   lockers.
    /// - [`StateError::Conflict`] when the CAS keeps losing.
    pub async fn assign(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        owner: &Owner,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        if let Some(held) = self.existing_ownership(owner).await? {
            if held.kiosk_id == kiosk_id && held.id == locker_id {
                return Ok(held);
            }
            return Err(StateError::OwnerHoldsAnother {
                kiosk_id: held.kiosk_id,
                locker_id: held.id,
            });
        }

        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            match row.status {
                LockerStatus::Reserved if owner.matches(&row) => return Ok(row),
                LockerStatus::Blocked => {
                    return Err(StateError::Blocked {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
                LockerStatus::Free if !row.is_vip => {
                    let mutation = LockerMutation {
                        status: LockerStatus::Reserved,
                        owner_type: Some(owner.owner_type()),
                        owner_key: Some(owner.key().to_owned()),
                        reserved_at: Some(Utc::now()),
                        owned_at: None,
                        is_vip: false,
                        blocked_reason: None,
                    };
                    match self
                        .store
                        .locker_cas_update(kiosk_id, locker_id, row.version, &mutation)
                        .await
                    {
                        Ok(updated) => {
                            self.events
                                .log_or_warn(
                                    kiosk_id,
                                    Some(locker_id),
                                    "locker_assigned",
                                    actor,
                                    serde_json::json!({ "owner": owner.key() }),
                                )
                                .await;
                            return Ok(updated);
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(StoreError::Constraint { .. }) => {
                            // Lost the one-locker-per-card race: the owner
                            // grabbed another locker between our check and
                            // the write.
                            let held = self.existing_ownership(owner).await?;
                            return Err(match held {
                                Some(h) => StateError::OwnerHoldsAnother {
                                    kiosk_id: h.kiosk_id,
                                    locker_id: h.id,
                                },
                                None => StateError::Busy {
                                    kiosk_id: kiosk_id.to_owned(),
                                    locker_id,
                                },
                            });
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ => {
                    return Err(StateError::Busy {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
            }
        }
        Err(StateError::Conflict)
    }

    /// Promote a reservation to ownership.
    ///
    /// Idempotent on a locker already owned by the same owner.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotReserved`] when the locker is not reserved by
    ///   this owner.
    /// - [`StateError::Conflict`] when the CAS keeps losing.
    pub async fn confirm(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        owner: &Owner,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            match row.status {
                LockerStatus::Owned if owner.matches(&row) => return Ok(row),
                LockerStatus::Reserved if owner.matches(&row) => {
                    let mutation = LockerMutation {
                        status: LockerStatus::Owned,
                        owner_type: row.owner_type,
                        owner_key: row.owner_key.clone(),
                        reserved_at: row.reserved_at,
                        owned_at: Some(Utc::now()),
                        is_vip: row.is_vip,
                        blocked_reason: None,
                    };
                    match self
                        .store
                        .locker_cas_update(kiosk_id, locker_id, row.version, &mutation)
                        .await
                    {
                        Ok(updated) => {
                            self.events
                                .log_or_warn(
                                    kiosk_id,
                                    Some(locker_id),
                                    "locker_confirmed",
                                    actor,
                                    serde_json::json!({ "owner": owner.key() }),
                                )
                                .await;
                            return Ok(updated);
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                LockerStatus::Blocked => {
                    return Err(StateError::Blocked {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
                _ => {
                    return Err(StateError::NotReserved {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
            }
        }
        Err(StateError::Conflict)
    }

    /// Return a locker to `Free`, clearing owner fields.
    ///
    /// No-op on an already-free locker. VIP lockers are untouched unless
    /// `force_vip` is set; the VIP flag itself survives a forced release.
    ///
    /// # Errors
    ///
    /// - [`StateError::VipProtected`] without `force_vip`.
    /// - [`StateError::Blocked`] for blocked lockers (use unblock).
    pub async fn release(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        force_vip: bool,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            match row.status {
                LockerStatus::Free => return Ok(row),
                LockerStatus::Blocked => {
                    return Err(StateError::Blocked {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
                LockerStatus::Owned | LockerStatus::Reserved => {
                    if row.is_vip && !force_vip {
                        return Err(StateError::VipProtected {
                            kiosk_id: kiosk_id.to_owned(),
                            locker_id,
                        });
                    }
                    let previous = row.status;
                    match self
                        .store
                        .locker_cas_update(kiosk_id, locker_id, row.version, &freed(&row))
                        .await
                    {
                        Ok(updated) => {
                            self.events
                                .log_or_warn(
                                    kiosk_id,
                                    Some(locker_id),
                                    "locker_released",
                                    actor,
                                    serde_json::json!({
                                        "owner": row.owner_key,
                                        "previous_status": previous.as_str(),
                                    }),
                                )
                                .await;
                            return Ok(updated);
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Err(StateError::Conflict)
    }

    /// Bind a free locker to a VIP card: `Owned`, `is_vip`, no reservation
    /// step. Idempotent for the same card.
    ///
    /// # Errors
    ///
    /// - [`StateError::Busy`] if the locker is taken or VIP for another card.
    pub async fn vip_bind(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        card_hash: &str,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        let owner = Owner::Vip(card_hash.to_owned());
        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            if row.is_vip && owner.matches(&row) {
                return Ok(row);
            }
            match row.status {
                LockerStatus::Blocked => {
                    return Err(StateError::Blocked {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
                LockerStatus::Free if !row.is_vip => {
                    let mutation = LockerMutation {
                        status: LockerStatus::Owned,
                        owner_type: Some(OwnerType::Vip),
                        owner_key: Some(card_hash.to_owned()),
                        reserved_at: None,
                        owned_at: Some(Utc::now()),
                        is_vip: true,
                        blocked_reason: None,
                    };
                    match self
                        .store
                        .locker_cas_update(kiosk_id, locker_id, row.version, &mutation)
                        .await
                    {
                        Ok(updated) => {
                            self.events
                                .log_or_warn(
                                    kiosk_id,
                                    Some(locker_id),
                                    "vip_bound",
                                    actor,
                                    serde_json::json!({ "owner": card_hash }),
                                )
                                .await;
                            return Ok(updated);
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                _ => {
                    return Err(StateError::Busy {
                        kiosk_id: kiosk_id.to_owned(),
                        locker_id,
                    })
                }
            }
        }
        Err(StateError::Conflict)
    }

    /// Remove a VIP binding, freeing the locker. No-op on non-VIP lockers.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] when the CAS keeps losing.
    pub async fn vip_unbind(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            if !row.is_vip {
                return Ok(row);
            }
            let mut mutation = freed(&row);
            mutation.is_vip = false;
            match self
                .store
                .locker_cas_update(kiosk_id, locker_id, row.version, &mutation)
                .await
            {
                Ok(updated) => {
                    self.events
                        .log_or_warn(
                            kiosk_id,
                            Some(locker_id),
                            "vip_unbound",
                            actor,
                            serde_json::json!({ "owner": row.owner_key }),
                        )
                        .await;
                    return Ok(updated);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict)
    }

    /// Administratively block a locker from any state. Owner fields are
    /// kept on the row for audit; a VIP locker requires `force_vip` and
    /// loses its binding.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VipProtected`] without `force_vip`.
    pub async fn block(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        reason: &str,
        force_vip: bool,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            if row.status == LockerStatus::Blocked {
                return Ok(row);
            }
            if row.is_vip && !force_vip {
                return Err(StateError::VipProtected {
                    kiosk_id: kiosk_id.to_owned(),
                    locker_id,
                });
            }
            let mutation = LockerMutation {
                status: LockerStatus::Blocked,
                owner_type: row.owner_type,
                owner_key: row.owner_key.clone(),
                reserved_at: row.reserved_at,
                owned_at: row.owned_at,
                is_vip: false,
                blocked_reason: Some(reason.to_owned()),
            };
            match self
                .store
                .locker_cas_update(kiosk_id, locker_id, row.version, &mutation)
                .await
            {
                Ok(updated) => {
                    self.events
                        .log_or_warn(
                            kiosk_id,
                            Some(locker_id),
                            "locker_blocked",
                            actor,
                            serde_json::json!({ "reason": reason, "was_vip": row.is_vip }),
                        )
                        .await;
                    return Ok(updated);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict)
    }

    /// Lift a block, returning the locker to `Free` with owner cleared.
    /// No-op on non-blocked lockers.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] when the CAS keeps losing.
    pub async fn unblock(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        actor: &str,
    ) -> Result<LockerRow, StateError> {
        for _ in 0..CAS_RETRIES {
            let row = self.locker(kiosk_id, locker_id).await?;
            if row.status != LockerStatus::Blocked {
                return Ok(row);
            }
            let mut mutation = freed(&row);
            mutation.is_vip = false;
            match self
                .store
                .locker_cas_update(kiosk_id, locker_id, row.version, &mutation)
                .await
            {
                Ok(updated) => {
                    self.events
                        .log_or_warn(kiosk_id, Some(locker_id), "locker_unblocked", actor, serde_json::json!({}))
                        .await;
                    return Ok(updated);
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::Conflict)
    }

    /// Sweep reservations older than `ttl` back to `Free`.
    ///
    /// Rows that changed underneath the sweep (confirmed or released in the
    /// meantime) are skipped silently; they will be re-examined next tick
    /// if still stale.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Store`] if the candidate scan fails.
    pub async fn expire_reservations(
        &self,
        ttl: std::time::Duration,
    ) -> Result<Vec<LockerRow>, StateError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(90));
        let candidates = self.store.expired_reservations(cutoff).await?;
        let mut released = Vec::new();

        for row in candidates {
            match self
                .store
                .locker_cas_update(&row.kiosk_id, row.id, row.version, &freed(&row))
                .await
            {
                Ok(updated) => {
                    self.events
                        .log_or_warn(
                            &row.kiosk_id,
                            Some(row.id),
                            "reservation_expired",
                            "system",
                            serde_json::json!({ "owner": row.owner_key }),
                        )
                        .await;
                    released.push(updated);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(kiosk_id = %row.kiosk_id, locker_id = row.id, "reservation changed during expiry sweep");
                }
                Err(e) => {
                    warn!(kiosk_id = %row.kiosk_id, locker_id = row.id, error = %e, "expiry sweep write failed");
                }
            }
        }

        if !released.is_empty() {
            info!(count = released.len(), "expired reservations released");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> StateManager {
        let store = Store::open_in_memory().await.unwrap();
        let events = Arc::new(EventLogger::init(store.clone()).await.unwrap());
        let m = StateManager::new(store, events);
        m.sync_lockers("K1", 10).await.unwrap();
        m
    }

    fn card(id: &str) -> Owner {
        Owner::Rfid(format!("hash-{id}"))
    }

    #[tokio::test]
    async fn assign_confirm_release_bumps_versions() {
        let m = manager().await;
        let owner = card("abc");

        let reserved = m.assign("K1", 5, &owner, "system").await.unwrap();
        assert_eq!(reserved.status, LockerStatus::Reserved);
        assert_eq!(reserved.version, 2);
        assert!(reserved.reserved_at.is_some());

        let owned = m.confirm("K1", 5, &owner, "system").await.unwrap();
        assert_eq!(owned.status, LockerStatus::Owned);
        assert_eq!(owned.version, 3);
        assert!(owned.owned_at.is_some());

        let freed = m.release("K1", 5, false, "system").await.unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
        assert_eq!(freed.version, 4);
        assert!(freed.owner_key.is_none());
        assert!(freed.reserved_at.is_none());
    }

    #[tokio::test]
    async fn assign_is_idempotent_for_the_same_owner() {
        let m = manager().await;
        let owner = card("abc");

        let first = m.assign("K1", 5, &owner, "system").await.unwrap();
        let second = m.assign("K1", 5, &owner, "system").await.unwrap();
        assert_eq!(second.version, first.version);
        assert_eq!(second.status, LockerStatus::Reserved);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let m = manager().await;
        let owner = card("abc");
        m.assign("K1", 5, &owner, "system").await.unwrap();

        let first = m.release("K1", 5, false, "system").await.unwrap();
        let second = m.release("K1", 5, false, "system").await.unwrap();
        assert_eq!(second.version, first.version);
        assert_eq!(second.status, LockerStatus::Free);
    }

    #[tokio::test]
    async fn second_owner_gets_busy() {
        let m = manager().await;
        m.assign("K1", 5, &card("a"), "system").await.unwrap();

        let err = m.assign("K1", 5, &card("b"), "system").await.unwrap_err();
        assert!(matches!(err, StateError::Busy { locker_id: 5, .. }));
    }

    #[tokio::test]
    async fn one_card_one_locker() {
        let m = manager().await;
        let owner = card("a");
        m.assign("K1", 5, &owner, "system").await.unwrap();

        let err = m.assign("K1", 6, &owner, "system").await.unwrap_err();
        assert!(matches!(err, StateError::OwnerHoldsAnother { locker_id: 5, .. }));

        let held = m.existing_ownership(&owner).await.unwrap().unwrap();
        assert_eq!(held.id, 5);
    }

    #[tokio::test]
    async fn confirm_requires_matching_reservation() {
        let m = manager().await;
        m.assign("K1", 5, &card("a"), "system").await.unwrap();

        let err = m.confirm("K1", 5, &card("b"), "system").await.unwrap_err();
        assert!(matches!(err, StateError::NotReserved { .. }));

        let err = m.confirm("K1", 6, &card("b"), "system").await.unwrap_err();
        assert!(matches!(err, StateError::NotReserved { .. }));
    }

    #[tokio::test]
    async fn confirm_is_idempotent_when_owned() {
        let m = manager().await;
        let owner = card("a");
        m.assign("K1", 5, &owner, "system").await.unwrap();
        let owned = m.confirm("K1", 5, &owner, "system").await.unwrap();
        let again = m.confirm("K1", 5, &owner, "system").await.unwrap();
        assert_eq!(again.version, owned.version);
    }

    #[tokio::test]
    async fn vip_lockers_never_reserve_and_survive_release() {
        let m = manager().await;

        let bound = m.vip_bind("K1", 3, "vip-hash", "staff:ana").await.unwrap();
        assert_eq!(bound.status, LockerStatus::Owned);
        assert!(bound.is_vip);

        // Not assignable, not plainly releasable.
        assert!(matches!(
            m.assign("K1", 3, &card("x"), "system").await.unwrap_err(),
            StateError::Busy { .. }
        ));
        assert!(matches!(
            m.release("K1", 3, false, "system").await.unwrap_err(),
            StateError::VipProtected { .. }
        ));

        // Forced release frees it but keeps the VIP flag.
        let freed = m.release("K1", 3, true, "staff:ana").await.unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
        assert!(freed.is_vip);
        assert!(freed.owner_key.is_none());

        // VIP lockers never show up as available.
        let available = m.available("K1", None).await.unwrap();
        assert!(available.iter().all(|l| l.id != 3));

        let unbound = m.vip_unbind("K1", 3, "staff:ana").await.unwrap();
        assert!(!unbound.is_vip);
    }

    #[tokio::test]
    async fn blocked_lockers_reject_assignment_until_unblocked() {
        let m = manager().await;
        m.block("K1", 7, "jammed latch", false, "staff:ana").await.unwrap();

        assert!(matches!(
            m.assign("K1", 7, &card("a"), "system").await.unwrap_err(),
            StateError::Blocked { .. }
        ));
        let available = m.available("K1", None).await.unwrap();
        assert!(available.iter().all(|l| l.id != 7));

        let freed = m.unblock("K1", 7, "staff:ana").await.unwrap();
        assert_eq!(freed.status, LockerStatus::Free);
        m.assign("K1", 7, &card("a"), "system").await.unwrap();
    }

    #[tokio::test]
    async fn blocking_an_owned_locker_keeps_owner_for_audit() {
        let m = manager().await;
        let owner = card("a");
        m.assign("K1", 5, &owner, "system").await.unwrap();
        m.confirm("K1", 5, &owner, "system").await.unwrap();

        let blocked = m.block("K1", 5, "water damage", false, "staff:ana").await.unwrap();
        assert_eq!(blocked.status, LockerStatus::Blocked);
        assert_eq!(blocked.owner_key.as_deref(), Some("hash-a"));

        // The former owner no longer "holds" it.
        assert!(m.existing_ownership(&owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocking_a_vip_locker_requires_force_and_drops_the_binding() {
        let m = manager().await;
        m.vip_bind("K1", 3, "vip-hash", "staff:ana").await.unwrap();

        assert!(matches!(
            m.block("K1", 3, "broken", false, "staff:ana").await.unwrap_err(),
            StateError::VipProtected { .. }
        ));

        let blocked = m.block("K1", 3, "broken", true, "staff:ana").await.unwrap();
        assert_eq!(blocked.status, LockerStatus::Blocked);
        assert!(!blocked.is_vip);
    }

    #[tokio::test]
    async fn stale_reservations_expire_fresh_ones_survive() {
        let m = manager().await;
        let store = m.store().clone();

        m.assign("K1", 1, &card("old"), "system").await.unwrap();
        m.assign("K1", 2, &card("new"), "system").await.unwrap();

        // Backdate locker 1's reservation well past the TTL.
        let row = store.locker("K1", 1).await.unwrap().unwrap();
        let mutation = LockerMutation {
            reserved_at: Some(Utc::now() - chrono::Duration::seconds(300)),
            owner_type: row.owner_type,
            owner_key: row.owner_key.clone(),
            status: row.status,
            owned_at: None,
            is_vip: false,
            blocked_reason: None,
        };
        store
            .locker_cas_update("K1", 1, row.version, &mutation)
            .await
            .unwrap();

        let released = m
            .expire_reservations(std::time::Duration::from_secs(90))
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, 1);
        assert_eq!(released[0].status, LockerStatus::Free);

        let fresh = store.locker("K1", 2).await.unwrap().unwrap();
        assert_eq!(fresh.status, LockerStatus::Reserved);
    }

    #[tokio::test]
    async fn concurrent_assign_wins_exactly_once() {
        let m = Arc::new(manager().await);

        let a = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.assign("K1", 7, &card("a"), "system").await })
        };
        let b = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.assign("K1", 7, &card("b"), "system").await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(
            a.is_ok() as u8 + b.is_ok() as u8,
            1,
            "exactly one assign must win: {a:?} vs {b:?}"
        );

        let row = m.locker("K1", 7).await.unwrap();
        assert_eq!(row.status, LockerStatus::Reserved);
        assert!(matches!(
            row.owner_key.as_deref(),
            Some("hash-a" | "hash-b")
        ));
    }
}
