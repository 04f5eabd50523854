//! Versioned JSON configuration.
//!
//! The document shape is fixed and `deny_unknown_fields`, so a typo'd
//! deploy fails closed instead of silently dropping a setting. Every deploy
//! stores a new version with its SHA-256 content hash; kiosks learn the
//! active hash through the heartbeat response and fetch the document from
//! the gateway. The in-memory snapshot is swapped atomically, so readers
//! (mapper, pipeline) always see a consistent document.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;

use lockerd_store::Store;

use crate::error::ConfigError;
use crate::zones::{self, Zone, ZoneExtension};

/// Feature switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Features {
    #[serde(default)]
    pub zones_enabled: bool,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_owned()
}

fn default_baud() -> u32 {
    9600
}

/// Bus and cabinet hardware settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Total physical lockers; drives the zone extension hook.
    #[serde(default)]
    pub total_lockers: i64,
    /// Relay cards installed but not yet assigned to a zone.
    #[serde(default)]
    pub free_relay_cards: Vec<u8>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud(),
            total_lockers: 0,
            free_relay_cards: Vec::new(),
        }
    }
}

fn default_pulse_ms() -> u64 {
    400
}
fn default_burst_ms() -> u64 {
    10_000
}
fn default_burst_interval_ms() -> u64 {
    2_000
}
fn default_command_interval_ms() -> u64 {
    300
}
fn default_reservation_ttl_sec() -> u64 {
    90
}
fn default_heartbeat_sec() -> u64 {
    10
}
fn default_poll_sec() -> u64 {
    5
}
fn default_offline_sec() -> u64 {
    30
}

/// Soft-timing knobs. All global; there is no per-kiosk override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingConfig {
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
    #[serde(default = "default_burst_ms")]
    pub burst_ms: u64,
    #[serde(default = "default_burst_interval_ms")]
    pub burst_interval_ms: u64,
    #[serde(default = "default_command_interval_ms")]
    pub command_interval_ms: u64,
    #[serde(default = "default_reservation_ttl_sec")]
    pub reservation_ttl_sec: u64,
    #[serde(default = "default_heartbeat_sec")]
    pub heartbeat_sec: u64,
    #[serde(default = "default_poll_sec")]
    pub poll_sec: u64,
    #[serde(default = "default_offline_sec")]
    pub offline_sec: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pulse_ms: default_pulse_ms(),
            burst_ms: default_burst_ms(),
            burst_interval_ms: default_burst_interval_ms(),
            command_interval_ms: default_command_interval_ms(),
            reservation_ttl_sec: default_reservation_ttl_sec(),
            heartbeat_sec: default_heartbeat_sec(),
            poll_sec: default_poll_sec(),
            offline_sec: default_offline_sec(),
        }
    }
}

/// The full configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConfigDocument {
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub timing: TimingConfig,
}

fn hash_json(json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

impl ConfigDocument {
    /// SHA-256 over the canonical JSON serialization.
    #[must_use]
    pub fn content_hash(&self) -> String {
        hash_json(&serde_json::to_string(self).unwrap_or_default())
    }

    /// Validate the document: zone table rules plus basic hardware sanity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] or a [`ConfigError::Zones`] variant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hardware.port.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "hardware.port must not be empty".to_owned(),
            });
        }
        if self.hardware.baud_rate == 0 {
            return Err(ConfigError::Invalid {
                reason: "hardware.baud_rate must be positive".to_owned(),
            });
        }
        zones::validate_zones(&self.zones)?;
        Ok(())
    }

    /// Look up an enabled zone by id.
    #[must_use]
    pub fn enabled_zone(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.enabled && z.id == id)
    }

    /// Ids of all enabled zones, in document order.
    #[must_use]
    pub fn enabled_zone_ids(&self) -> Vec<String> {
        self.zones
            .iter()
            .filter(|z| z.enabled)
            .map(|z| z.id.clone())
            .collect()
    }
}

/// The currently applied configuration.
#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub version: i64,
    pub hash: String,
    pub doc: ConfigDocument,
}

/// Owns the applied config version and its in-memory snapshot.
pub struct ConfigManager {
    store: Store,
    active: RwLock<Arc<ActiveConfig>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager").finish_non_exhaustive()
    }
}

impl ConfigManager {
    /// Load the applied config from the store, deploying defaults on first
    /// boot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the stored document no longer
    /// parses, or a store error.
    pub async fn load(store: Store) -> Result<Self, ConfigError> {
        let active = match store.applied_config().await? {
            Some(row) => {
                let doc: ConfigDocument =
                    serde_json::from_str(&row.doc).map_err(|e| ConfigError::Invalid {
                        reason: format!("stored config v{} does not parse: {e}", row.version),
                    })?;
                ActiveConfig {
                    version: row.version,
                    hash: row.hash,
                    doc,
                }
            }
            None => {
                let doc = ConfigDocument::default();
                let json = serde_json::to_string(&doc).unwrap_or_default();
                let hash = hash_json(&json);
                let row = store
                    .insert_config_version(&json, &hash, chrono::Utc::now())
                    .await?;
                store.mark_config_applied(row.version).await?;
                info!(version = row.version, "default config deployed on first boot");
                ActiveConfig {
                    version: row.version,
                    hash,
                    doc,
                }
            }
        };

        Ok(Self {
            store,
            active: RwLock::new(Arc::new(active)),
        })
    }

    /// The current config snapshot. Cheap; safe to hold across awaits.
    pub async fn snapshot(&self) -> Arc<ActiveConfig> {
        Arc::clone(&*self.active.read().await)
    }

    /// Validate, run the zone extension hook, store, and apply a new
    /// document. On any failure the previous version stays live.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`], a zone error (including
    /// `ZONE_CAPACITY_EXCEEDED`), or a store error.
    pub async fn deploy(&self, doc: ConfigDocument) -> Result<Arc<ActiveConfig>, ConfigError> {
        let mut doc = doc;
        doc.validate()?;

        let extension = zones::extend_zones(
            &mut doc.zones,
            doc.features.zones_enabled,
            doc.hardware.total_lockers,
            &mut doc.hardware.free_relay_cards,
        )?;
        // Re-validate after the hook; a failure here discards the mutated
        // copy and the prior config remains live.
        doc.validate()?;

        let json = serde_json::to_string(&doc).map_err(|e| ConfigError::Invalid {
            reason: format!("config does not serialize: {e}"),
        })?;
        let hash = hash_json(&json);

        let row = self
            .store
            .insert_config_version(&json, &hash, chrono::Utc::now())
            .await?;
        self.store.mark_config_applied(row.version).await?;

        if let ZoneExtension::Extended {
            ref zone_id,
            added,
            ref cards_added,
        } = extension
        {
            info!(
                zone = %zone_id,
                range = ?added,
                cards = ?cards_added,
                "zone extended to cover new lockers"
            );
        }

        let active = Arc::new(ActiveConfig {
            version: row.version,
            hash,
            doc,
        });
        *self.active.write().await = Arc::clone(&active);

        info!(version = active.version, hash = %active.hash, "config deployed");
        Ok(active)
    }

    /// Re-apply the newest version below the current one.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NoPreviousVersion`] when already at the oldest.
    /// - [`ConfigError::Invalid`] if the older document no longer parses.
    pub async fn rollback(&self) -> Result<Arc<ActiveConfig>, ConfigError> {
        let current = self.snapshot().await;
        let Some(prev) = self.store.config_version_before(current.version).await? else {
            return Err(ConfigError::NoPreviousVersion);
        };

        let doc: ConfigDocument =
            serde_json::from_str(&prev.doc).map_err(|e| ConfigError::Invalid {
                reason: format!("stored config v{} does not parse: {e}", prev.version),
            })?;

        self.store.mark_config_applied(prev.version).await?;

        let active = Arc::new(ActiveConfig {
            version: prev.version,
            hash: prev.hash,
            doc,
        });
        *self.active.write().await = Arc::clone(&active);

        info!(version = active.version, "config rolled back");
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_zone_doc() -> ConfigDocument {
        serde_json::from_str(
            r#"{
                "features": { "zones_enabled": true },
                "hardware": { "port": "/dev/ttyUSB0", "baud_rate": 9600 },
                "zones": [
                    { "id": "mens",   "ranges": [[1,32]],  "relay_cards": [1,2], "enabled": true },
                    { "id": "womens", "ranges": [[33,64]], "relay_cards": [3,4], "enabled": true }
                ],
                "timing": { "pulse_ms": 400 }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn the_documented_shape_parses_with_defaults() {
        let doc = two_zone_doc();
        assert!(doc.features.zones_enabled);
        assert_eq!(doc.zones.len(), 2);
        assert_eq!(doc.timing.pulse_ms, 400);
        assert_eq!(doc.timing.burst_ms, 10_000);
        assert_eq!(doc.timing.reservation_ttl_sec, 90);
        doc.validate().unwrap();
    }

    #[test]
    fn unknown_fields_fail_closed() {
        let result: Result<ConfigDocument, _> =
            serde_json::from_str(r#"{ "features": { "zone_enabled": true } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn content_hash_is_stable_and_content_sensitive() {
        let a = two_zone_doc();
        let b = two_zone_doc();
        assert_eq!(a.content_hash(), b.content_hash());

        let mut c = two_zone_doc();
        c.timing.pulse_ms = 500;
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[tokio::test]
    async fn deploy_apply_rollback_cycle() {
        let store = lockerd_store::Store::open_in_memory().await.unwrap();
        let manager = ConfigManager::load(store).await.unwrap();
        let first = manager.snapshot().await;

        let deployed = manager.deploy(two_zone_doc()).await.unwrap();
        assert!(deployed.version > first.version);
        assert_eq!(manager.snapshot().await.version, deployed.version);

        let rolled = manager.rollback().await.unwrap();
        assert_eq!(rolled.version, first.version);
        assert!(!rolled.doc.features.zones_enabled);
    }

    #[tokio::test]
    async fn failed_deploy_leaves_previous_config_live() {
        let store = lockerd_store::Store::open_in_memory().await.unwrap();
        let manager = ConfigManager::load(store).await.unwrap();
        let good = manager.deploy(two_zone_doc()).await.unwrap();

        // Grow the cabinet without any free cards: the extension hook must
        // refuse and the applied config must stay put.
        let mut bad = two_zone_doc();
        bad.hardware.total_lockers = 96;
        let err = manager.deploy(bad).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zones(crate::error::ZoneError::CapacityExceeded { .. })
        ));
        assert_eq!(manager.snapshot().await.version, good.version);
    }

    #[tokio::test]
    async fn deploy_runs_the_extension_hook() {
        let store = lockerd_store::Store::open_in_memory().await.unwrap();
        let manager = ConfigManager::load(store).await.unwrap();

        let mut doc = two_zone_doc();
        doc.hardware.total_lockers = 96;
        doc.hardware.free_relay_cards = vec![5, 6];
        let active = manager.deploy(doc).await.unwrap();

        let womens = active.doc.enabled_zone("womens").unwrap();
        assert_eq!(womens.ranges, vec![[33, 96]]);
        assert_eq!(womens.relay_cards, vec![3, 4, 5, 6]);
        assert!(active.doc.hardware.free_relay_cards.is_empty());
    }
}
