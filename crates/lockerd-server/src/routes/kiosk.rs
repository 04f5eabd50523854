//! Kiosk-facing routes: the card-scan flow and the control plane.
//!
//! - `POST /api/kiosk/scan` — card tap decision tree
//! - `POST /api/kiosk/select` — user picked a locker
//! - `POST /api/kiosk/heartbeat`
//! - `POST /api/kiosk/commands/poll`
//! - `POST /api/kiosk/commands/complete`
//! - `POST /api/kiosk/commands/clear`
//! - `GET  /api/kiosk/config` — fetch the active config document

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use lockerd_core::config::ConfigDocument;
use lockerd_core::heartbeat::HeartbeatRequest;
use lockerd_core::queue::CommandQueue;
use lockerd_core::state::Owner;
use lockerd_store::{CommandRow, LockerRow};

use crate::error::ApiError;
use crate::state::AppState;

/// Build the `/api/kiosk` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/scan", post(scan))
        .route("/select", post(select))
        .route("/heartbeat", post(heartbeat))
        .route("/commands/poll", post(poll_commands))
        .route("/commands/complete", post(complete_command))
        .route("/commands/clear", post(clear_commands))
        .route("/config", get(fetch_config))
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub card_id: String,
    pub kiosk_id: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ScanResponse {
    /// The card already holds a locker: it has been pulsed open.
    Open {
        action: &'static str,
        locker_id: i64,
        vip: bool,
    },
    /// No ownership: offer free lockers to pick from.
    Lockers {
        action: &'static str,
        lockers: Vec<LockerRow>,
    },
    /// Nothing free right now.
    NoLockers { error: &'static str },
}

/// Card tap: open-and-release for returning cards, otherwise offer free
/// lockers. A VIP locker opens but is never auto-released.
async fn scan(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, ApiError> {
    let hash = state.events.hash_card(&req.card_id);

    let mut existing = state
        .state
        .existing_ownership(&Owner::Rfid(hash.clone()))
        .await?;
    if existing.is_none() {
        existing = state.state.existing_ownership(&Owner::Vip(hash)).await?;
    }

    if let Some(locker) = existing {
        // Pulse first; a hardware fault leaves ownership untouched.
        state.pipeline.pulse(locker.id, None).await?;
        if !locker.is_vip {
            state
                .state
                .release(&locker.kiosk_id, locker.id, false, "system")
                .await?;
        }
        return Ok(Json(ScanResponse::Open {
            action: "open_locker",
            locker_id: locker.id,
            vip: locker.is_vip,
        }));
    }

    // Fresh card: offer this kiosk's free lockers, narrowed to its zone.
    let cfg = state.config.snapshot().await;
    let zone_id = state
        .store
        .kiosk(&req.kiosk_id)
        .await?
        .and_then(|k| k.zone_id);
    let zone = zone_id.as_deref().and_then(|z| cfg.doc.enabled_zone(z));

    let lockers = state.state.available(&req.kiosk_id, zone).await?;
    if lockers.is_empty() {
        Ok(Json(ScanResponse::NoLockers { error: "no_lockers" }))
    } else {
        Ok(Json(ScanResponse::Lockers {
            action: "show_lockers",
            lockers,
        }))
    }
}

#[derive(Debug, Deserialize)]
pub struct SelectRequest {
    pub card_id: String,
    pub kiosk_id: String,
    pub locker_id: i64,
}

#[derive(Debug, Serialize)]
pub struct SelectResponse {
    pub success: bool,
    pub locker_id: i64,
}

/// The user picked a locker: reserve it, pulse the latch, confirm. A
/// failed pulse reverts the reservation so the locker is not stranded.
async fn select(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<SelectResponse>, ApiError> {
    let owner = Owner::Rfid(state.events.hash_card(&req.card_id));

    state
        .state
        .assign(&req.kiosk_id, req.locker_id, &owner, "system")
        .await?;

    match state.pipeline.pulse(req.locker_id, None).await {
        Ok(()) => {
            state
                .state
                .confirm(&req.kiosk_id, req.locker_id, &owner, "system")
                .await?;
            Ok(Json(SelectResponse {
                success: true,
                locker_id: req.locker_id,
            }))
        }
        Err(pulse_err) => {
            if let Err(revert_err) = state
                .state
                .release(&req.kiosk_id, req.locker_id, false, "system")
                .await
            {
                warn!(
                    kiosk_id = %req.kiosk_id,
                    locker_id = req.locker_id,
                    error = %revert_err,
                    "failed to revert reservation after pulse failure"
                );
            }
            Err(pulse_err.into())
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatAck {
    pub heartbeat_sec: u64,
    pub poll_sec: u64,
    pub config_version: i64,
    pub config_hash: String,
}

/// Heartbeat: refresh liveness, store telemetry, and hand back polling
/// cadence plus the active config hash so the kiosk knows when to fetch.
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    state.heartbeat.record(&req).await?;

    let cfg = state.config.snapshot().await;
    Ok(Json(HeartbeatAck {
        heartbeat_sec: cfg.doc.timing.heartbeat_sec,
        poll_sec: cfg.doc.timing.poll_sec,
        config_version: cfg.version,
        config_hash: cfg.hash.clone(),
    }))
}

fn default_poll_limit() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    pub kiosk_id: String,
    #[serde(default = "default_poll_limit")]
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct CommandDto {
    pub command_id: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub attempts: i64,
}

impl CommandDto {
    fn from_row(row: &CommandRow) -> Result<Self, ApiError> {
        let payload = CommandQueue::payload(row)?;
        Ok(Self {
            command_id: row.command_id.clone(),
            command_type: row.command_type.clone(),
            payload: serde_json::to_value(payload)
                .map_err(|e| ApiError::Internal(e.to_string()))?,
            attempts: row.attempts,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub commands: Vec<CommandDto>,
}

/// Claim work. At most one command per kiosk is in flight; re-polling
/// returns the outstanding command again.
async fn poll_commands(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PollRequest>,
) -> Result<Json<PollResponse>, ApiError> {
    let rows = state.queue.poll(&req.kiosk_id, req.limit).await?;
    let commands = rows
        .iter()
        .map(CommandDto::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(PollResponse { commands }))
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub command_id: String,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub command_id: String,
    pub status: lockerd_store::CommandStatus,
    pub attempts: i64,
}

async fn complete_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let row = state
        .queue
        .complete(&req.command_id, req.success, req.error.as_deref())
        .await?;
    Ok(Json(CompleteResponse {
        command_id: row.command_id,
        status: row.status,
        attempts: row.attempts,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    pub kiosk_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub removed: u64,
}

/// Kiosk restart: discard stale pending work (e.g. a bulk open queued for
/// a closing time that has passed).
async fn clear_commands(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClearRequest>,
) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.queue.clear_pending(&req.kiosk_id).await?;
    Ok(Json(ClearResponse { removed }))
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub version: i64,
    pub hash: String,
    pub config: ConfigDocument,
}

/// The active config document, fetched by kiosks when the heartbeat hash
/// differs from the one they last applied.
async fn fetch_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let cfg = state.config.snapshot().await;
    Json(ConfigResponse {
        version: cfg.version,
        hash: cfg.hash.clone(),
        config: cfg.doc.clone(),
    })
}
