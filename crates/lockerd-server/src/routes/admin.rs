//! Administrative panel routes, mounted at `/api/admin`.
//!
//! Staff operations: block/unblock lockers, end-of-day bulk release (CSV),
//! VIP contract management, config deploy/rollback, kiosk fleet views,
//! audit event queries, and command queue administration.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lockerd_core::config::ConfigDocument;
use lockerd_core::heartbeat::HeartbeatStats;
use lockerd_core::queue::CommandPayload;
use lockerd_core::report;
use lockerd_store::{
    CommandRow, EventFilter, EventRow, KioskRow, KioskStatus, LockerRow, TelemetrySampleRow,
    VipContractRow,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Build the `/api/admin` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/lockers/block", post(block_locker))
        .route("/lockers/unblock", post(unblock_locker))
        .route("/lockers/sync", post(sync_lockers))
        .route("/release/end-of-day", post(end_of_day))
        .route("/emergency/all-off", post(emergency_all_off))
        .route("/vip", get(list_vip).post(create_vip))
        .route("/vip/{contract_id}/cancel", post(cancel_vip))
        .route("/vip/{contract_id}/extend", post(extend_vip))
        .route("/vip/{contract_id}/transfer/request", post(vip_transfer_request))
        .route("/vip/{contract_id}/transfer/approve", post(vip_transfer_approve))
        .route("/vip/{contract_id}/transfer/reject", post(vip_transfer_reject))
        .route("/config", get(get_config))
        .route("/config/deploy", post(deploy_config))
        .route("/config/rollback", post(rollback_config))
        .route("/events", get(query_events))
        .route("/kiosks", get(list_kiosks))
        .route("/kiosks/stats", get(kiosk_stats))
        .route("/kiosks/zone", post(set_kiosk_zone))
        .route("/kiosks/status", post(set_kiosk_status))
        .route("/kiosks/{kiosk_id}/telemetry", get(kiosk_telemetry))
        .route("/commands", post(enqueue_command))
        .route("/commands/{command_id}/cancel", post(cancel_command))
}

fn staff_actor(staff_user: Option<&str>) -> String {
    staff_user.map_or_else(|| "staff".to_owned(), |u| format!("staff:{u}"))
}

// ── Lockers ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    pub reason: String,
    #[serde(default)]
    pub force_vip: bool,
    #[serde(default)]
    pub staff_user: Option<String>,
}

async fn block_locker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlockRequest>,
) -> Result<Json<LockerRow>, ApiError> {
    let row = state
        .state
        .block(
            &req.kiosk_id,
            req.locker_id,
            &req.reason,
            req.force_vip,
            &staff_actor(req.staff_user.as_deref()),
        )
        .await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct UnblockRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    #[serde(default)]
    pub staff_user: Option<String>,
}

async fn unblock_locker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UnblockRequest>,
) -> Result<Json<LockerRow>, ApiError> {
    let row = state
        .state
        .unblock(&req.kiosk_id, req.locker_id, &staff_actor(req.staff_user.as_deref()))
        .await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub kiosk_id: String,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub created: u64,
}

/// Provisioning: make sure locker rows `1..=count` exist for a kiosk.
async fn sync_lockers(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    if req.count < 1 {
        return Err(ApiError::Validation("count must be at least 1".to_owned()));
    }
    let created = state.state.sync_lockers(&req.kiosk_id, req.count).await?;
    Ok(Json(SyncResponse { created }))
}

// ── End of day ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EndOfDayRequest {
    pub kiosk_id: String,
    #[serde(default)]
    pub include_vip: bool,
    #[serde(default)]
    pub staff_user: Option<String>,
}

/// Bulk release at closing time. Responds with the fixed-schema CSV.
async fn end_of_day(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EndOfDayRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state
        .state
        .bulk_release_end_of_day(
            &req.kiosk_id,
            req.include_vip,
            &staff_actor(req.staff_user.as_deref()),
        )
        .await?;

    let csv = report::to_csv(&rows).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv))
}

// ── Emergency ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AllOffRequest {
    pub slave: u8,
    #[serde(default)]
    pub staff_user: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AllOffResponse {
    pub success: bool,
}

/// Force every relay of one card off in a single frame.
async fn emergency_all_off(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllOffRequest>,
) -> Result<Json<AllOffResponse>, ApiError> {
    state.pipeline.all_relays_off(req.slave).await?;
    state
        .events
        .log_or_warn(
            "gateway",
            None,
            "emergency_all_off",
            &staff_actor(req.staff_user.as_deref()),
            serde_json::json!({ "slave": req.slave }),
        )
        .await;
    Ok(Json(AllOffResponse { success: true }))
}

// ── VIP contracts ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateVipRequest {
    pub kiosk_id: String,
    pub locker_id: i64,
    /// Raw card id; hashed before it touches storage.
    pub card_id: String,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub staff_user: Option<String>,
}

async fn create_vip(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVipRequest>,
) -> Result<Json<VipContractRow>, ApiError> {
    let card_hash = state.events.hash_card(&req.card_id);
    let row = state
        .vip
        .create(
            &req.kiosk_id,
            req.locker_id,
            &card_hash,
            req.start_date.unwrap_or_else(Utc::now),
            req.end_date,
            req.plan.as_deref(),
            &staff_actor(req.staff_user.as_deref()),
        )
        .await?;
    Ok(Json(row))
}

async fn list_vip(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<VipContractRow>>, ApiError> {
    Ok(Json(state.vip.list().await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct StaffOnlyRequest {
    #[serde(default)]
    pub staff_user: Option<String>,
}

async fn cancel_vip(
    State(state): State<Arc<AppState>>,
    Path(contract_id): Path<String>,
    Json(req): Json<StaffOnlyRequest>,
) -> Result<Json<VipContractRow>, ApiError> {
    let row = state
        .vip
        .cancel(&contract_id, &staff_actor(req.staff_user.as_deref()))
        .await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct ExtendVipRequest {
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub staff_user: Option<String>,
}

async fn extend_vip(
    State(state): State<Arc<AppState>>,
    Path(contract_id): Path<String>,
    Json(req): Json<ExtendVipRequest>,
) -> Result<Json<VipContractRow>, ApiError> {
    let row = state
        .vip
        .extend(&contract_id, req.end_date, &staff_actor(req.staff_user.as_deref()))
        .await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    /// Raw target card id; hashed before storage.
    pub to_card_id: String,
    #[serde(default)]
    pub staff_user: Option<String>,
}

async fn vip_transfer_request(
    State(state): State<Arc<AppState>>,
    Path(contract_id): Path<String>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<VipContractRow>, ApiError> {
    let to_hash = state.events.hash_card(&req.to_card_id);
    let row = state
        .vip
        .transfer_request(&contract_id, &to_hash, &staff_actor(req.staff_user.as_deref()))
        .await?;
    Ok(Json(row))
}

async fn vip_transfer_approve(
    State(state): State<Arc<AppState>>,
    Path(contract_id): Path<String>,
    Json(req): Json<StaffOnlyRequest>,
) -> Result<Json<VipContractRow>, ApiError> {
    let row = state
        .vip
        .transfer_approve(&contract_id, &staff_actor(req.staff_user.as_deref()))
        .await?;
    Ok(Json(row))
}

async fn vip_transfer_reject(
    State(state): State<Arc<AppState>>,
    Path(contract_id): Path<String>,
    Json(req): Json<StaffOnlyRequest>,
) -> Result<Json<VipContractRow>, ApiError> {
    let row = state
        .vip
        .transfer_reject(&contract_id, &staff_actor(req.staff_user.as_deref()))
        .await?;
    Ok(Json(row))
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ConfigInfo {
    pub version: i64,
    pub hash: String,
    pub config: ConfigDocument,
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigInfo> {
    let cfg = state.config.snapshot().await;
    Json(ConfigInfo {
        version: cfg.version,
        hash: cfg.hash.clone(),
        config: cfg.doc.clone(),
    })
}

/// Deploy a new config document. Validation and the zone extension hook
/// run before anything is stored; failures leave the old config live.
async fn deploy_config(
    State(state): State<Arc<AppState>>,
    Json(doc): Json<ConfigDocument>,
) -> Result<Json<ConfigInfo>, ApiError> {
    let active = state.config.deploy(doc).await?;
    state
        .events
        .log_or_warn(
            "gateway",
            None,
            "config_deployed",
            "staff",
            serde_json::json!({ "version": active.version, "hash": active.hash }),
        )
        .await;
    Ok(Json(ConfigInfo {
        version: active.version,
        hash: active.hash.clone(),
        config: active.doc.clone(),
    }))
}

async fn rollback_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigInfo>, ApiError> {
    let active = state.config.rollback().await?;
    state
        .events
        .log_or_warn(
            "gateway",
            None,
            "config_rolled_back",
            "staff",
            serde_json::json!({ "version": active.version }),
        )
        .await;
    Ok(Json(ConfigInfo {
        version: active.version,
        hash: active.hash.clone(),
        config: active.doc.clone(),
    }))
}

// ── Events ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kiosk_id: Option<String>,
    #[serde(default)]
    pub locker_id: Option<i64>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

async fn query_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventQuery>,
) -> Result<Json<Vec<EventRow>>, ApiError> {
    let filter = EventFilter {
        from: q.from,
        to: q.to,
        kiosk_id: q.kiosk_id,
        locker_id: q.locker_id,
        event_type: q.event_type,
        actor: q.actor,
        limit: q.limit,
    };
    Ok(Json(state.events.query(&filter).await?))
}

// ── Kiosks ───────────────────────────────────────────────────────────

async fn list_kiosks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<KioskRow>>, ApiError> {
    Ok(Json(state.heartbeat.all().await?))
}

async fn kiosk_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HeartbeatStats>, ApiError> {
    Ok(Json(state.heartbeat.statistics().await?))
}

#[derive(Debug, Deserialize)]
pub struct KioskZoneRequest {
    pub kiosk_id: String,
    #[serde(default)]
    pub zone_id: Option<String>,
}

async fn set_kiosk_zone(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KioskZoneRequest>,
) -> Result<Json<KioskRow>, ApiError> {
    if let Some(ref zone_id) = req.zone_id {
        let cfg = state.config.snapshot().await;
        crate::routes::resolve_zone(&cfg.doc, zone_id)?;
    }
    state
        .store
        .set_kiosk_zone(&req.kiosk_id, req.zone_id.as_deref())
        .await
        .map_err(|e| match e {
            lockerd_store::StoreError::Conflict { .. } => {
                ApiError::NotFound(format!("kiosk '{}' not found", req.kiosk_id))
            }
            other => other.into(),
        })?;

    state
        .store
        .kiosk(&req.kiosk_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("kiosk '{}' not found", req.kiosk_id)))
}

#[derive(Debug, Deserialize)]
pub struct KioskStatusRequest {
    pub kiosk_id: String,
    pub status: KioskStatus,
}

async fn set_kiosk_status(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KioskStatusRequest>,
) -> Result<Json<KioskRow>, ApiError> {
    state
        .store
        .set_kiosk_status(&req.kiosk_id, req.status)
        .await
        .map_err(|e| match e {
            lockerd_store::StoreError::Conflict { .. } => {
                ApiError::NotFound(format!("kiosk '{}' not found", req.kiosk_id))
            }
            other => other.into(),
        })?;

    state
        .store
        .kiosk(&req.kiosk_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("kiosk '{}' not found", req.kiosk_id)))
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    #[serde(default = "default_telemetry_limit")]
    pub limit: i64,
}

fn default_telemetry_limit() -> i64 {
    50
}

async fn kiosk_telemetry(
    State(state): State<Arc<AppState>>,
    Path(kiosk_id): Path<String>,
    Query(q): Query<TelemetryQuery>,
) -> Result<Json<Vec<TelemetrySampleRow>>, ApiError> {
    Ok(Json(state.heartbeat.telemetry(&kiosk_id, q.limit).await?))
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub kiosk_id: String,
    pub payload: CommandPayload,
}

async fn enqueue_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<CommandRow>, ApiError> {
    Ok(Json(state.queue.enqueue(&req.kiosk_id, &req.payload).await?))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

async fn cancel_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.queue.cancel(&command_id).await?;
    Ok(Json(CancelResponse { cancelled: true }))
}
