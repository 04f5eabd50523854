//! Gateway health surface.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use lockerd_core::pipeline::MetricsSnapshot;

use crate::state::AppState;

/// Build the `/health` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct ZoneSummary {
    pub id: String,
    pub enabled: bool,
    pub lockers: i64,
    pub relay_cards: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the bus is lost or slaves are quarantined.
    pub status: &'static str,
    pub zones_enabled: bool,
    pub config_version: i64,
    pub config_hash: String,
    pub total_lockers: i64,
    pub zones: Vec<ZoneSummary>,
    pub bus: MetricsSnapshot,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let cfg = state.config.snapshot().await;
    let bus = state.pipeline.metrics().await;

    let zones: Vec<ZoneSummary> = cfg
        .doc
        .zones
        .iter()
        .map(|z| ZoneSummary {
            id: z.id.clone(),
            enabled: z.enabled,
            lockers: z.locker_count(),
            relay_cards: z.relay_cards.len(),
        })
        .collect();

    let covered: i64 = cfg
        .doc
        .zones
        .iter()
        .filter(|z| z.enabled)
        .map(lockerd_core::zones::Zone::locker_count)
        .sum();
    let total_lockers = cfg.doc.hardware.total_lockers.max(covered);

    let status = if bus.connection_lost || !bus.quarantined_slaves.is_empty() {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        zones_enabled: cfg.doc.features.zones_enabled,
        config_version: cfg.version,
        config_hash: cfg.hash.clone(),
        total_lockers,
        zones,
        bus,
    })
}
