//! Locker routes.
//!
//! - `POST /api/locker/open` — staff/master-PIN open of any locker
//! - `GET  /api/lockers/available?kiosk_id=…&zone=…`
//! - `GET  /api/lockers/all?kiosk_id=…&zone=…`

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use lockerd_store::{LockerRow, LockerStatus};

use crate::error::ApiError;
use crate::routes::resolve_zone;
use crate::state::AppState;

/// Build the `/api/locker` router.
pub fn locker_router() -> Router<Arc<AppState>> {
    Router::new().route("/open", post(open_locker))
}

/// Build the `/api/lockers` router.
pub fn list_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/available", get(available_lockers))
        .route("/all", get(all_lockers))
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    pub locker_id: i64,
    #[serde(default)]
    pub kiosk_id: Option<String>,
    #[serde(default)]
    pub staff_user: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    /// Re-pulse at intervals for a stuck latch. Opt-in only.
    #[serde(default)]
    pub burst: bool,
}

#[derive(Debug, Serialize)]
pub struct OpenResponse {
    pub success: bool,
    pub message: String,
}

/// Staff open: validates the zone claim, refuses blocked lockers, pulses
/// the relay, and audits who asked and why. Does not touch ownership.
async fn open_locker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenRequest>,
) -> Result<Json<OpenResponse>, ApiError> {
    let cfg = state.config.snapshot().await;

    if let Some(ref zone_id) = req.zone {
        let zone = resolve_zone(&cfg.doc, zone_id)?;
        if !zone.contains(req.locker_id) {
            return Err(ApiError::LockerOutOfZone {
                locker_id: req.locker_id,
                zone: zone_id.clone(),
            });
        }
    }

    for row in state.store.lockers_by_id(req.locker_id).await? {
        if row.status == LockerStatus::Blocked {
            return Err(ApiError::LockerBlocked(format!(
                "locker {} on kiosk '{}' is blocked: {}",
                row.id,
                row.kiosk_id,
                row.blocked_reason.as_deref().unwrap_or("no reason recorded"),
            )));
        }
    }

    if req.burst {
        state.pipeline.burst(req.locker_id, None, None).await?;
    } else {
        state.pipeline.pulse(req.locker_id, None).await?;
    }

    let actor = req
        .staff_user
        .as_deref()
        .map_or_else(|| "staff".to_owned(), |u| format!("staff:{u}"));
    state
        .events
        .log_or_warn(
            req.kiosk_id.as_deref().unwrap_or("gateway"),
            Some(req.locker_id),
            "staff_open",
            &actor,
            serde_json::json!({ "reason": req.reason, "burst": req.burst }),
        )
        .await;

    Ok(Json(OpenResponse {
        success: true,
        message: format!("locker {} opened", req.locker_id),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LockerQuery {
    pub kiosk_id: String,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LockersResponse {
    pub lockers: Vec<LockerRow>,
}

/// Free, non-VIP lockers, ordered by id.
async fn available_lockers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LockerQuery>,
) -> Result<Json<LockersResponse>, ApiError> {
    let cfg = state.config.snapshot().await;
    let zone = match q.zone.as_deref() {
        Some(zone_id) => Some(resolve_zone(&cfg.doc, zone_id)?),
        None => None,
    };

    let lockers = state.state.available(&q.kiosk_id, zone).await?;
    Ok(Json(LockersResponse { lockers }))
}

/// Every locker of the kiosk, any status.
async fn all_lockers(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LockerQuery>,
) -> Result<Json<LockersResponse>, ApiError> {
    let cfg = state.config.snapshot().await;
    let zone = match q.zone.as_deref() {
        Some(zone_id) => Some(resolve_zone(&cfg.doc, zone_id)?),
        None => None,
    };

    let lockers = state.state.all(&q.kiosk_id, zone).await?;
    Ok(Json(LockersResponse { lockers }))
}
