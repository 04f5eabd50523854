//! Kiosk liveness tracking.
//!
//! Heartbeats upsert the kiosk row and refresh `last_seen`; a background
//! sweep (driven by the server) flips stale kiosks to `offline`. Telemetry
//! payloads ride along with heartbeats and are kept as rolling samples for
//! diagnostics, pruned after the retention window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use lockerd_store::{KioskRow, KioskStatus, Store, TelemetrySampleRow};

use crate::error::HeartbeatError;
use crate::events::EventLogger;

/// A heartbeat as posted by a kiosk.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    pub kiosk_id: String,
    pub version: String,
    #[serde(default)]
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub config_hash: Option<String>,
    /// Free-form vitals (voltages, CPU, locker-status breakdown, ...);
    /// stored verbatim as a sample.
    #[serde(default)]
    pub telemetry: Option<serde_json::Value>,
}

/// Kiosk counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub online: i64,
    pub offline: i64,
    pub maintenance: i64,
    pub error: i64,
}

impl StatusCounts {
    fn add(&mut self, status: KioskStatus, count: i64) {
        match status {
            KioskStatus::Online => self.online += count,
            KioskStatus::Offline => self.offline += count,
            KioskStatus::Maintenance => self.maintenance += count,
            KioskStatus::Error => self.error += count,
        }
    }
}

/// Fleet totals with a per-zone breakdown. Kiosks without a zone group
/// under `"unassigned"`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStats {
    pub total: i64,
    pub counts: StatusCounts,
    pub zones: BTreeMap<String, StatusCounts>,
}

/// Tracks kiosk liveness, versions, and telemetry.
pub struct HeartbeatManager {
    store: Store,
    events: Arc<EventLogger>,
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager").finish_non_exhaustive()
    }
}

impl HeartbeatManager {
    #[must_use]
    pub fn new(store: Store, events: Arc<EventLogger>) -> Self {
        Self { store, events }
    }

    /// Record a heartbeat: upsert the kiosk, store telemetry, and audit the
    /// offline → online transition.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if a write fails.
    pub async fn record(&self, req: &HeartbeatRequest) -> Result<KioskRow, HeartbeatError> {
        let previous = self.store.kiosk(&req.kiosk_id).await?;
        let now = Utc::now();

        let row = self
            .store
            .kiosk_heartbeat(
                &req.kiosk_id,
                &req.version,
                req.hardware_id.as_deref(),
                req.config_hash.as_deref(),
                now,
            )
            .await?;

        if previous.map(|k| k.status) == Some(KioskStatus::Offline)
            && row.status == KioskStatus::Online
        {
            info!(kiosk_id = %req.kiosk_id, "kiosk back online");
            self.events
                .log_or_warn(&req.kiosk_id, None, "kiosk_online", "system", serde_json::json!({}))
                .await;
        }

        if let Some(ref telemetry) = req.telemetry {
            self.store
                .insert_telemetry(&req.kiosk_id, &telemetry.to_string(), now)
                .await?;
        }

        Ok(row)
    }

    /// Flip kiosks silent for longer than `threshold` to `offline`.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if the update fails.
    pub async fn sweep_offline(&self, threshold: Duration) -> Result<Vec<String>, HeartbeatError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let flipped = self.store.kiosks_mark_offline(cutoff).await?;

        for kiosk_id in &flipped {
            info!(kiosk_id = %kiosk_id, "kiosk marked offline");
            self.events
                .log_or_warn(kiosk_id, None, "kiosk_offline", "system", serde_json::json!({}))
                .await;
        }
        Ok(flipped)
    }

    /// All kiosks.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if the read fails.
    pub async fn all(&self) -> Result<Vec<KioskRow>, HeartbeatError> {
        Ok(self.store.all_kiosks().await?)
    }

    /// Kiosks in one zone.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if the read fails.
    pub async fn by_zone(&self, zone_id: &str) -> Result<Vec<KioskRow>, HeartbeatError> {
        Ok(self.store.kiosks_by_zone(zone_id).await?)
    }

    /// Fleet totals and per-zone status breakdowns.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if the read fails.
    pub async fn statistics(&self) -> Result<HeartbeatStats, HeartbeatError> {
        let rows = self.store.kiosk_status_counts().await?;

        let mut total = 0;
        let mut counts = StatusCounts::default();
        let mut zones: BTreeMap<String, StatusCounts> = BTreeMap::new();

        for (zone, status, count) in rows {
            total += count;
            counts.add(status, count);
            zones
                .entry(zone.unwrap_or_else(|| "unassigned".to_owned()))
                .or_default()
                .add(status, count);
        }

        Ok(HeartbeatStats { total, counts, zones })
    }

    /// Latest telemetry samples for a kiosk.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if the read fails.
    pub async fn telemetry(
        &self,
        kiosk_id: &str,
        limit: i64,
    ) -> Result<Vec<TelemetrySampleRow>, HeartbeatError> {
        Ok(self.store.telemetry_for_kiosk(kiosk_id, limit).await?)
    }

    /// Drop telemetry samples older than `retention`. Returns rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`HeartbeatError::Store`] if the delete fails.
    pub async fn prune_telemetry(&self, retention: Duration) -> Result<u64, HeartbeatError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        Ok(self.store.prune_telemetry(cutoff).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (HeartbeatManager, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let events = Arc::new(EventLogger::init(store.clone()).await.unwrap());
        (HeartbeatManager::new(store.clone(), events), store)
    }

    fn beat(kiosk: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            kiosk_id: kiosk.to_owned(),
            version: "2.1.0".to_owned(),
            hardware_id: None,
            config_hash: Some("deadbeef".to_owned()),
            telemetry: Some(serde_json::json!({ "cpu": 12, "temp_c": 41 })),
        }
    }

    #[tokio::test]
    async fn heartbeat_stores_telemetry_and_goes_online() {
        let (m, store) = manager().await;

        let row = m.record(&beat("K1")).await.unwrap();
        assert_eq!(row.status, KioskStatus::Online);
        assert_eq!(row.config_hash.as_deref(), Some("deadbeef"));

        let samples = store.telemetry_for_kiosk("K1", 10).await.unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn offline_to_online_transition_is_audited() {
        let (m, store) = manager().await;
        m.record(&beat("K1")).await.unwrap();

        // Force offline, then heartbeat again.
        store
            .kiosks_mark_offline(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        m.record(&beat("K1")).await.unwrap();

        let events = store
            .events(&lockerd_store::EventFilter {
                event_type: Some("kiosk_online".to_owned()),
                ..lockerd_store::EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn statistics_break_down_by_zone() {
        let (m, store) = manager().await;
        m.record(&beat("K1")).await.unwrap();
        m.record(&beat("K2")).await.unwrap();
        m.record(&beat("K3")).await.unwrap();
        store.set_kiosk_zone("K1", Some("mens")).await.unwrap();
        store.set_kiosk_zone("K2", Some("mens")).await.unwrap();

        let stats = m.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.counts.online, 3);
        assert_eq!(stats.zones["mens"].online, 2);
        assert_eq!(stats.zones["unassigned"].online, 1);
    }
}
