//! HTTP error mapping.
//!
//! Maps domain errors from `lockerd-core` into JSON responses with a
//! machine-readable `error` code, a human-readable `message`, and a
//! `trace_id` for log correlation. `UNKNOWN_ZONE` additionally carries the
//! list of known zones so a kiosk can self-correct.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use lockerd_core::error::{
    ConfigError, EventError, HeartbeatError, MapError, PipelineError, QueueError, StateError,
    VipError, ZoneError,
};
use lockerd_store::StoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// The requested zone does not exist or is disabled.
    UnknownZone { zone: String, available: Vec<String> },
    /// The locker id is not covered by the requested zone.
    LockerOutOfZone { locker_id: i64, zone: String },
    /// The locker cannot be addressed at all.
    UnknownLocker { locker_id: i64 },
    /// The locker is held, VIP, or otherwise not assignable.
    LockerBusy(String),
    /// The locker is administratively blocked.
    LockerBlocked(String),
    /// The operation would touch a VIP locker without the force flag.
    VipProtected(String),
    /// Transport, quarantine, or burst failure.
    HardwareError(String),
    /// Optimistic concurrency kept losing.
    ConcurrencyConflict,
    /// Zone extension ran out of relay cards.
    ZoneCapacityExceeded(String),
    /// Bad input.
    Validation(String),
    /// Requested resource not found.
    NotFound(String),
    /// The operation conflicts with current state.
    Conflict(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_zones: Option<Vec<String>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let mut available_zones = None;

        let (status, code, message) = match self {
            Self::UnknownZone { zone, available } => {
                available_zones = Some(available);
                (
                    StatusCode::BAD_REQUEST,
                    "UNKNOWN_ZONE",
                    format!("unknown or disabled zone '{zone}'"),
                )
            }
            Self::LockerOutOfZone { locker_id, zone } => (
                StatusCode::BAD_REQUEST,
                "LOCKER_OUT_OF_ZONE",
                format!("locker {locker_id} is not in zone '{zone}'"),
            ),
            Self::UnknownLocker { locker_id } => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_LOCKER",
                format!("locker {locker_id} cannot be addressed"),
            ),
            Self::LockerBusy(msg) => (StatusCode::CONFLICT, "LOCKER_BUSY", msg),
            Self::LockerBlocked(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "LOCKER_BLOCKED", msg),
            Self::VipProtected(msg) => (StatusCode::UNPROCESSABLE_ENTITY, "VIP_PROTECTED", msg),
            Self::HardwareError(msg) => (StatusCode::BAD_GATEWAY, "HARDWARE_ERROR", msg),
            Self::ConcurrencyConflict => (
                StatusCode::CONFLICT,
                "CONCURRENCY_CONFLICT",
                "concurrent update conflict, please retry".to_owned(),
            ),
            Self::ZoneCapacityExceeded(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "ZONE_CAPACITY_EXCEEDED",
                msg,
            ),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            Self::Internal(msg) => {
                error!(trace_id = %trace_id, message = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: code,
            message,
            trace_id,
            available_zones,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound { .. } => Self::NotFound(err.to_string()),
            StateError::Busy { .. } | StateError::OwnerHoldsAnother { .. } => {
                Self::LockerBusy(err.to_string())
            }
            StateError::Blocked { .. } => Self::LockerBlocked(err.to_string()),
            StateError::VipProtected { .. } => Self::VipProtected(err.to_string()),
            StateError::NotReserved { .. } => Self::Conflict(err.to_string()),
            StateError::Conflict => Self::ConcurrencyConflict,
            StateError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Map(MapError::UnknownLocker { locker_id }) => {
                Self::UnknownLocker { locker_id }
            }
            PipelineError::Map(MapError::HardwareConfig { .. }) => {
                Self::HardwareError(err.to_string())
            }
            PipelineError::Quarantined { .. }
            | PipelineError::Hardware { .. }
            | PipelineError::BurstExhausted { .. } => Self::HardwareError(err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound { .. } => Self::NotFound(err.to_string()),
            QueueError::NotInFlight { .. } | QueueError::NotPending { .. } => {
                Self::Conflict(err.to_string())
            }
            QueueError::BadPayload { .. } => Self::Validation(err.to_string()),
            QueueError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Zones(ZoneError::CapacityExceeded { .. }) => {
                Self::ZoneCapacityExceeded(err.to_string())
            }
            ConfigError::Zones(_) | ConfigError::Invalid { .. } => Self::Validation(err.to_string()),
            ConfigError::VersionNotFound { .. } => Self::NotFound(err.to_string()),
            ConfigError::NoPreviousVersion => Self::Conflict(err.to_string()),
            ConfigError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<VipError> for ApiError {
    fn from(err: VipError) -> Self {
        match err {
            VipError::ContractNotFound { .. } => Self::NotFound(err.to_string()),
            VipError::NotActive { .. }
            | VipError::LockerContracted { .. }
            | VipError::CardContracted
            | VipError::NoTransferPending { .. } => Self::Conflict(err.to_string()),
            VipError::State(inner) => inner.into(),
            VipError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<HeartbeatError> for ApiError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}
