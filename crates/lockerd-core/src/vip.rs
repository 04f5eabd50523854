//! VIP contracts: long-term binding of one locker to one card.
//!
//! The contract table is the paperwork; the locker binding itself lives in
//! the state machine (`is_vip` + vip owner). This service keeps the two in
//! step: creating a contract binds the locker, cancelling or expiring it
//! unbinds, and a transfer is a two-step workflow (request, then approve or
//! reject) that retires the old contract as `transferred` and opens a new
//! one for the target card.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use lockerd_store::{ContractStatus, Store, VipContractRow};

use crate::error::VipError;
use crate::events::EventLogger;
use crate::state::StateManager;

/// Operator-facing VIP contract service.
pub struct VipService {
    store: Store,
    state: Arc<StateManager>,
    events: Arc<EventLogger>,
}

impl std::fmt::Debug for VipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipService").finish_non_exhaustive()
    }
}

impl VipService {
    #[must_use]
    pub fn new(store: Store, state: Arc<StateManager>, events: Arc<EventLogger>) -> Self {
        Self { store, state, events }
    }

    /// Create a contract and bind the locker to the card.
    ///
    /// # Errors
    ///
    /// - [`VipError::LockerContracted`] / [`VipError::CardContracted`] when
    ///   either side already has an active contract.
    /// - [`VipError::State`] when the locker is not free.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        kiosk_id: &str,
        locker_id: i64,
        card_hash: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        plan: Option<&str>,
        actor: &str,
    ) -> Result<VipContractRow, VipError> {
        if self
            .store
            .active_vip_for_locker(kiosk_id, locker_id)
            .await?
            .is_some()
        {
            return Err(VipError::LockerContracted {
                kiosk_id: kiosk_id.to_owned(),
                locker_id,
            });
        }
        if self.store.active_vip_for_card(card_hash).await?.is_some() {
            return Err(VipError::CardContracted);
        }

        // Bind first: it validates the locker is free. Roll the binding back
        // if the contract insert loses a race on the unique indexes.
        self.state.vip_bind(kiosk_id, locker_id, card_hash, actor).await?;

        let contract_id = uuid::Uuid::new_v4().to_string();
        let row = match self
            .store
            .insert_vip_contract(
                &contract_id,
                kiosk_id,
                locker_id,
                card_hash,
                start_date,
                end_date,
                plan,
                Utc::now(),
            )
            .await
        {
            Ok(row) => row,
            Err(e) => {
                if let Err(unbind_err) = self.state.vip_unbind(kiosk_id, locker_id, actor).await {
                    warn!(kiosk_id, locker_id, error = %unbind_err, "failed to roll back vip binding");
                }
                return Err(e.into());
            }
        };

        info!(contract_id = %row.contract_id, kiosk_id, locker_id, "vip contract created");
        self.events
            .log_or_warn(
                kiosk_id,
                Some(locker_id),
                "vip_contract_created",
                actor,
                serde_json::json!({
                    "contract_id": row.contract_id,
                    "card": card_hash,
                    "end_date": end_date,
                }),
            )
            .await;
        Ok(row)
    }

    /// Cancel an active contract and free the locker.
    ///
    /// # Errors
    ///
    /// - [`VipError::ContractNotFound`] / [`VipError::NotActive`].
    pub async fn cancel(&self, contract_id: &str, actor: &str) -> Result<VipContractRow, VipError> {
        let row = self
            .transition(contract_id, ContractStatus::Cancelled)
            .await?;

        self.state
            .vip_unbind(&row.kiosk_id, row.locker_id, actor)
            .await?;

        self.events
            .log_or_warn(
                &row.kiosk_id,
                Some(row.locker_id),
                "vip_contract_cancelled",
                actor,
                serde_json::json!({ "contract_id": contract_id }),
            )
            .await;
        Ok(row)
    }

    /// Extend an active contract's end date.
    ///
    /// # Errors
    ///
    /// - [`VipError::ContractNotFound`] / [`VipError::NotActive`].
    pub async fn extend(
        &self,
        contract_id: &str,
        new_end: DateTime<Utc>,
        actor: &str,
    ) -> Result<VipContractRow, VipError> {
        let row = match self
            .store
            .extend_vip_contract(contract_id, new_end, Utc::now())
            .await?
        {
            Some(row) => row,
            None => return Err(self.missing_or_inactive(contract_id).await?),
        };

        self.events
            .log_or_warn(
                &row.kiosk_id,
                Some(row.locker_id),
                "vip_contract_extended",
                actor,
                serde_json::json!({ "contract_id": contract_id, "end_date": new_end }),
            )
            .await;
        Ok(row)
    }

    /// Request a transfer of an active contract to another card.
    ///
    /// # Errors
    ///
    /// - [`VipError::CardContracted`] when the target card already has an
    ///   active contract.
    pub async fn transfer_request(
        &self,
        contract_id: &str,
        to_card_hash: &str,
        actor: &str,
    ) -> Result<VipContractRow, VipError> {
        if self.store.active_vip_for_card(to_card_hash).await?.is_some() {
            return Err(VipError::CardContracted);
        }

        let row = match self
            .store
            .set_vip_transfer_target(contract_id, Some(to_card_hash), Utc::now())
            .await?
        {
            Some(row) => row,
            None => return Err(self.missing_or_inactive(contract_id).await?),
        };

        self.events
            .log_or_warn(
                &row.kiosk_id,
                Some(row.locker_id),
                "vip_transfer_requested",
                actor,
                serde_json::json!({ "contract_id": contract_id, "to_card": to_card_hash }),
            )
            .await;
        Ok(row)
    }

    /// Approve a pending transfer: the old contract retires as
    /// `transferred`, a new contract for the target card takes over the
    /// locker and the remaining term.
    ///
    /// # Errors
    ///
    /// - [`VipError::NoTransferPending`] when no transfer was requested.
    pub async fn transfer_approve(
        &self,
        contract_id: &str,
        actor: &str,
    ) -> Result<VipContractRow, VipError> {
        let old = self.contract(contract_id).await?;
        if old.status != ContractStatus::Active {
            return Err(VipError::NotActive {
                contract_id: contract_id.to_owned(),
            });
        }
        let Some(to_card) = old.transfer_to_card.clone() else {
            return Err(VipError::NoTransferPending {
                contract_id: contract_id.to_owned(),
            });
        };

        self.transition(contract_id, ContractStatus::Transferred).await?;

        // Re-point the locker binding, then open the successor contract.
        self.state
            .vip_unbind(&old.kiosk_id, old.locker_id, actor)
            .await?;
        self.state
            .vip_bind(&old.kiosk_id, old.locker_id, &to_card, actor)
            .await?;

        let new_id = uuid::Uuid::new_v4().to_string();
        let new = self
            .store
            .insert_vip_contract(
                &new_id,
                &old.kiosk_id,
                old.locker_id,
                &to_card,
                Utc::now(),
                old.end_date,
                old.plan.as_deref(),
                Utc::now(),
            )
            .await?;

        info!(
            old_contract = contract_id,
            new_contract = %new.contract_id,
            "vip contract transferred"
        );
        self.events
            .log_or_warn(
                &old.kiosk_id,
                Some(old.locker_id),
                "vip_transferred",
                actor,
                serde_json::json!({
                    "from_contract": contract_id,
                    "to_contract": new.contract_id,
                    "to_card": to_card,
                }),
            )
            .await;
        Ok(new)
    }

    /// Reject a pending transfer, clearing the request.
    ///
    /// # Errors
    ///
    /// - [`VipError::NoTransferPending`] when no transfer was requested.
    pub async fn transfer_reject(
        &self,
        contract_id: &str,
        actor: &str,
    ) -> Result<VipContractRow, VipError> {
        let current = self.contract(contract_id).await?;
        if current.transfer_to_card.is_none() {
            return Err(VipError::NoTransferPending {
                contract_id: contract_id.to_owned(),
            });
        }

        let row = match self
            .store
            .set_vip_transfer_target(contract_id, None, Utc::now())
            .await?
        {
            Some(row) => row,
            None => return Err(self.missing_or_inactive(contract_id).await?),
        };

        self.events
            .log_or_warn(
                &row.kiosk_id,
                Some(row.locker_id),
                "vip_transfer_rejected",
                actor,
                serde_json::json!({ "contract_id": contract_id }),
            )
            .await;
        Ok(row)
    }

    /// Expire contracts past their end date, unbinding their lockers.
    /// Returns the number expired.
    ///
    /// # Errors
    ///
    /// Returns [`VipError::Store`] if the scan fails.
    pub async fn expire_contracts(&self) -> Result<u64, VipError> {
        let now = Utc::now();
        let expired = self.store.expired_vip_contracts(now).await?;
        let mut count = 0u64;

        for contract in expired {
            match self
                .store
                .set_vip_status(&contract.contract_id, ContractStatus::Active, ContractStatus::Expired, now)
                .await
            {
                Ok(Some(_)) => {
                    if let Err(e) = self
                        .state
                        .vip_unbind(&contract.kiosk_id, contract.locker_id, "system")
                        .await
                    {
                        warn!(
                            contract_id = %contract.contract_id,
                            error = %e,
                            "failed to unbind locker for expired contract"
                        );
                    }
                    self.events
                        .log_or_warn(
                            &contract.kiosk_id,
                            Some(contract.locker_id),
                            "vip_contract_expired",
                            "system",
                            serde_json::json!({ "contract_id": contract.contract_id }),
                        )
                        .await;
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(contract_id = %contract.contract_id, error = %e, "failed to expire contract");
                }
            }
        }

        if count > 0 {
            info!(count, "vip contracts expired");
        }
        Ok(count)
    }

    /// All contracts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`VipError::Store`] if the read fails.
    pub async fn list(&self) -> Result<Vec<VipContractRow>, VipError> {
        Ok(self.store.all_vip_contracts().await?)
    }

    async fn contract(&self, contract_id: &str) -> Result<VipContractRow, VipError> {
        self.store
            .vip_contract(contract_id)
            .await?
            .ok_or_else(|| VipError::ContractNotFound {
                contract_id: contract_id.to_owned(),
            })
    }

    async fn transition(
        &self,
        contract_id: &str,
        to: ContractStatus,
    ) -> Result<VipContractRow, VipError> {
        match self
            .store
            .set_vip_status(contract_id, ContractStatus::Active, to, Utc::now())
            .await?
        {
            Some(row) => Ok(row),
            None => Err(self.missing_or_inactive(contract_id).await?),
        }
    }

    async fn missing_or_inactive(&self, contract_id: &str) -> Result<VipError, VipError> {
        Ok(match self.store.vip_contract(contract_id).await? {
            Some(_) => VipError::NotActive {
                contract_id: contract_id.to_owned(),
            },
            None => VipError::ContractNotFound {
                contract_id: contract_id.to_owned(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockerd_store::LockerStatus;

    async fn service() -> VipService {
        let store = Store::open_in_memory().await.unwrap();
        let events = Arc::new(EventLogger::init(store.clone()).await.unwrap());
        let state = Arc::new(StateManager::new(store.clone(), Arc::clone(&events)));
        state.sync_lockers("K1", 10).await.unwrap();
        VipService::new(store, state, events)
    }

    fn month() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now, now + chrono::Duration::days(30))
    }

    #[tokio::test]
    async fn create_binds_the_locker() {
        let s = service().await;
        let (start, end) = month();

        let contract = s
            .create("K1", 5, "card-a", start, end, Some("annual"), "staff:ana")
            .await
            .unwrap();
        assert_eq!(contract.status, ContractStatus::Active);

        let locker = s.state.locker("K1", 5).await.unwrap();
        assert!(locker.is_vip);
        assert_eq!(locker.status, LockerStatus::Owned);
        assert_eq!(locker.owner_key.as_deref(), Some("card-a"));
    }

    #[tokio::test]
    async fn double_contract_on_locker_or_card_is_rejected() {
        let s = service().await;
        let (start, end) = month();
        s.create("K1", 5, "card-a", start, end, None, "staff:ana").await.unwrap();

        assert!(matches!(
            s.create("K1", 5, "card-b", start, end, None, "staff:ana").await.unwrap_err(),
            VipError::LockerContracted { locker_id: 5, .. }
        ));
        assert!(matches!(
            s.create("K1", 6, "card-a", start, end, None, "staff:ana").await.unwrap_err(),
            VipError::CardContracted
        ));
    }

    #[tokio::test]
    async fn cancel_frees_the_locker() {
        let s = service().await;
        let (start, end) = month();
        let contract = s.create("K1", 5, "card-a", start, end, None, "staff:ana").await.unwrap();

        s.cancel(&contract.contract_id, "staff:ana").await.unwrap();

        let locker = s.state.locker("K1", 5).await.unwrap();
        assert!(!locker.is_vip);
        assert_eq!(locker.status, LockerStatus::Free);
        assert!(matches!(
            s.cancel(&contract.contract_id, "staff:ana").await.unwrap_err(),
            VipError::NotActive { .. }
        ));
    }

    #[tokio::test]
    async fn transfer_workflow_rebinds_and_opens_a_successor() {
        let s = service().await;
        let (start, end) = month();
        let old = s.create("K1", 5, "card-a", start, end, Some("annual"), "staff:ana").await.unwrap();

        s.transfer_request(&old.contract_id, "card-b", "staff:ana").await.unwrap();
        let new = s.transfer_approve(&old.contract_id, "staff:ana").await.unwrap();

        assert_eq!(new.rfid_card, "card-b");
        assert_eq!(new.locker_id, 5);
        assert_eq!(new.end_date, end);
        assert_eq!(new.plan.as_deref(), Some("annual"));

        let retired = s.store.vip_contract(&old.contract_id).await.unwrap().unwrap();
        assert_eq!(retired.status, ContractStatus::Transferred);

        let locker = s.state.locker("K1", 5).await.unwrap();
        assert_eq!(locker.owner_key.as_deref(), Some("card-b"));
        assert!(locker.is_vip);
    }

    #[tokio::test]
    async fn transfer_reject_clears_the_request() {
        let s = service().await;
        let (start, end) = month();
        let contract = s.create("K1", 5, "card-a", start, end, None, "staff:ana").await.unwrap();

        assert!(matches!(
            s.transfer_approve(&contract.contract_id, "staff:ana").await.unwrap_err(),
            VipError::NoTransferPending { .. }
        ));

        s.transfer_request(&contract.contract_id, "card-b", "staff:ana").await.unwrap();
        let cleared = s.transfer_reject(&contract.contract_id, "staff:ana").await.unwrap();
        assert!(cleared.transfer_to_card.is_none());
    }

    #[tokio::test]
    async fn expiry_sweep_unbinds_past_contracts() {
        let s = service().await;
        let now = Utc::now();
        let contract = s
            .create(
                "K1",
                5,
                "card-a",
                now - chrono::Duration::days(60),
                now + chrono::Duration::days(1),
                None,
                "staff:ana",
            )
            .await
            .unwrap();

        // Backdate the end date past now.
        sqlx::query("UPDATE vip_contracts SET end_date = ? WHERE contract_id = ?")
            .bind(now - chrono::Duration::days(1))
            .bind(&contract.contract_id)
            .execute(s.store.pool())
            .await
            .unwrap();

        let expired = s.expire_contracts().await.unwrap();
        assert_eq!(expired, 1);

        let locker = s.state.locker("K1", 5).await.unwrap();
        assert!(!locker.is_vip);
        assert_eq!(locker.status, LockerStatus::Free);
    }
}
