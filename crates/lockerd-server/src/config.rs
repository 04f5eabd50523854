//! Server configuration.
//!
//! Loads from environment variables with sensible defaults. All settings
//! can be overridden via `LOCKERD_*` variables; the serial port and baud
//! rate normally come from the deployed config document, with
//! `LOCKERD_SERIAL_PORT` as an operational override.

use std::net::SocketAddr;

/// Gateway process configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Path of the SQLite database file.
    pub database_path: String,
    /// Log level filter (e.g. `info`, `debug`).
    pub log_level: String,
    /// Overrides the config document's serial port when set.
    pub serial_port_override: Option<String>,
    /// Run against the in-memory bus simulator instead of real hardware.
    pub simulated_bus: bool,
    /// Seconds between offline sweeps of the kiosk fleet.
    pub heartbeat_sweep_secs: u64,
    /// Seconds between reservation expiry sweeps.
    pub expiry_sweep_secs: u64,
    /// Seconds between maintenance passes (telemetry prune, VIP expiry).
    pub maintenance_sweep_secs: u64,
    /// Days of kiosk telemetry to keep.
    pub telemetry_retention_days: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LOCKERD_BIND_ADDR` — bind address (default: `127.0.0.1:8090`)
    /// - `PORT` — port shorthand, binds `0.0.0.0` (overridden by `LOCKERD_BIND_ADDR`)
    /// - `LOCKERD_DB` — SQLite file path (default: `./lockerd.db`)
    /// - `LOCKERD_LOG_LEVEL` — log filter (default: `info`)
    /// - `LOCKERD_SERIAL_PORT` — serial device override (optional)
    /// - `LOCKERD_SIMULATED_BUS` — `true` to run without hardware (default: `false`)
    /// - `LOCKERD_HEARTBEAT_SWEEP` — seconds between offline sweeps (default: `5`)
    /// - `LOCKERD_EXPIRY_SWEEP` — seconds between reservation sweeps (default: `10`)
    /// - `LOCKERD_MAINTENANCE_SWEEP` — seconds between maintenance passes (default: `3600`)
    /// - `LOCKERD_TELEMETRY_RETENTION_DAYS` — telemetry retention (default: `7`)
    #[must_use]
    pub fn from_env() -> Self {
        let bind_addr = if let Ok(addr) = std::env::var("LOCKERD_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8090)))
        } else if let Ok(port_str) = std::env::var("PORT") {
            let port: u16 = port_str.parse().unwrap_or(8090);
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(([127, 0, 0, 1], 8090))
        };

        let database_path =
            std::env::var("LOCKERD_DB").unwrap_or_else(|_| "./lockerd.db".to_owned());

        let log_level = std::env::var("LOCKERD_LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());

        let serial_port_override = std::env::var("LOCKERD_SERIAL_PORT").ok();

        let simulated_bus = std::env::var("LOCKERD_SIMULATED_BUS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let env_u64 = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            bind_addr,
            database_path,
            log_level,
            serial_port_override,
            simulated_bus,
            heartbeat_sweep_secs: env_u64("LOCKERD_HEARTBEAT_SWEEP", 5),
            expiry_sweep_secs: env_u64("LOCKERD_EXPIRY_SWEEP", 10),
            maintenance_sweep_secs: env_u64("LOCKERD_MAINTENANCE_SWEEP", 3600),
            telemetry_retention_days: env_u64("LOCKERD_TELEMETRY_RETENTION_DAYS", 7),
        }
    }
}
