//! `lockerd` gateway entry point.
//!
//! Bootstraps the SQLite store, config manager, bus transport, and all
//! managers, then starts the Axum HTTP server with graceful shutdown.
//! Three background workers run alongside the server and are cancelled on
//! shutdown: the kiosk offline sweep, the reservation expiry sweep, and an
//! hourly maintenance pass (telemetry pruning, VIP contract expiry).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use lockerd_core::bus::{open_serial_port, MockPort};
use lockerd_core::config::ConfigManager;
use lockerd_store::Store;

use lockerd_server::app::{build_router, build_state};
use lockerd_server::config::ServerConfig;
use lockerd_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(db = %config.database_path, "lockerd starting");

    let store = Store::open(&config.database_path)
        .await
        .context("failed to open database")?;
    let config_manager = Arc::new(
        ConfigManager::load(store.clone())
            .await
            .context("failed to load config")?,
    );

    // The serial device comes from the deployed config document unless
    // overridden by the environment.
    let state = if config.simulated_bus {
        warn!("running against the simulated bus, no hardware will be driven");
        build_state(store, Arc::clone(&config_manager), MockPort::new()).await?
    } else {
        let snapshot = config_manager.snapshot().await;
        let device = config
            .serial_port_override
            .clone()
            .unwrap_or_else(|| snapshot.doc.hardware.port.clone());
        let port = open_serial_port(&device, snapshot.doc.hardware.baud_rate)
            .with_context(|| format!("failed to open serial port {device}"))?;
        info!(device = %device, baud = snapshot.doc.hardware.baud_rate, "serial port open");
        build_state(store, Arc::clone(&config_manager), port).await?
    };

    // Shutdown signal channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let offline_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval = config.heartbeat_sweep_secs;
        tokio::spawn(async move {
            offline_sweep_worker(&state, &mut rx, interval).await;
        })
    };

    let expiry_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval = config.expiry_sweep_secs;
        tokio::spawn(async move {
            expiry_sweep_worker(&state, &mut rx, interval).await;
        })
    };

    let maintenance_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        let interval = config.maintenance_sweep_secs;
        let retention_days = config.telemetry_retention_days;
        tokio::spawn(async move {
            maintenance_worker(&state, &mut rx, interval, retention_days).await;
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "lockerd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    for handle in [offline_handle, expiry_handle, maintenance_handle] {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("lockerd stopped");
    Ok(())
}

/// Mark kiosks offline when their heartbeats go stale.
async fn offline_sweep_worker(
    state: &Arc<AppState>,
    shutdown: &mut watch::Receiver<bool>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs, "offline sweep worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let threshold = {
                    let cfg = state.config.snapshot().await;
                    Duration::from_secs(cfg.doc.timing.offline_sec)
                };
                if let Err(e) = state.heartbeat.sweep_offline(threshold).await {
                    warn!(error = %e, "offline sweep failed");
                }
            }
            _ = shutdown.changed() => {
                info!("offline sweep worker shutting down");
                return;
            }
        }
    }
}

/// Return stale reservations to the free pool.
async fn expiry_sweep_worker(
    state: &Arc<AppState>,
    shutdown: &mut watch::Receiver<bool>,
    interval_secs: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    info!(interval_secs, "reservation expiry worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let ttl = {
                    let cfg = state.config.snapshot().await;
                    Duration::from_secs(cfg.doc.timing.reservation_ttl_sec)
                };
                if let Err(e) = state.state.expire_reservations(ttl).await {
                    warn!(error = %e, "reservation expiry sweep failed");
                }
            }
            _ = shutdown.changed() => {
                info!("reservation expiry worker shutting down");
                return;
            }
        }
    }
}

/// Hourly housekeeping: prune old telemetry, expire VIP contracts.
async fn maintenance_worker(
    state: &Arc<AppState>,
    shutdown: &mut watch::Receiver<bool>,
    interval_secs: u64,
    retention_days: u64,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(60)));
    info!(interval_secs, "maintenance worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let retention = Duration::from_secs(retention_days * 24 * 3600);
                match state.heartbeat.prune_telemetry(retention).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "telemetry samples pruned"),
                    Err(e) => warn!(error = %e, "telemetry prune failed"),
                }
                if let Err(e) = state.vip.expire_contracts().await {
                    warn!(error = %e, "vip contract expiry failed");
                }
            }
            _ = shutdown.changed() => {
                info!("maintenance worker shutting down");
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
