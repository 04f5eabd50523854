//! Shared application state for the `lockerd` gateway.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. Every dependency is injected explicitly;
//! there are no module-level singletons.

use std::sync::Arc;

use lockerd_core::config::ConfigManager;
use lockerd_core::events::EventLogger;
use lockerd_core::heartbeat::HeartbeatManager;
use lockerd_core::pipeline::Pipeline;
use lockerd_core::queue::CommandQueue;
use lockerd_core::state::StateManager;
use lockerd_core::vip::VipService;
use lockerd_store::Store;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Direct store access (read-mostly admin queries).
    pub store: Store,
    /// Versioned config document and its live snapshot.
    pub config: Arc<ConfigManager>,
    /// Relay actuation pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Locker ownership state machine.
    pub state: Arc<StateManager>,
    /// Kiosk liveness and telemetry.
    pub heartbeat: Arc<HeartbeatManager>,
    /// Durable kiosk command queue.
    pub queue: Arc<CommandQueue>,
    /// VIP contract workflows.
    pub vip: Arc<VipService>,
    /// Audit events and card hashing.
    pub events: Arc<EventLogger>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
