//! Relay command pipeline.
//!
//! Every relay actuation in the system goes through here. A single async
//! mutex guarantees that the ON and OFF frames of one pulse are never
//! interleaved with another pulse's frames; the bus worker below already
//! serializes individual frames.
//!
//! Coil writes retry with exponential backoff inside a wall-clock budget.
//! A slave that keeps failing is quarantined: pulses to it fail fast for
//! the lockout duration while other slaves continue normally. The
//! quarantine table is the only mutable shared table in the pipeline.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::BusTransport;
use crate::config::ConfigManager;
use crate::error::{BusError, FrameError, PipelineError};
use crate::frame::COILS_PER_CARD;
use crate::mapper::map_locker;

/// Tuning for retries and the slave lockout policy.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Coil write attempts per pulse phase.
    pub max_retries: u32,
    /// First retry backoff; doubles per attempt.
    pub retry_base: Duration,
    /// Backoff ceiling.
    pub retry_cap: Duration,
    /// Wall-clock budget for one pulse.
    pub pulse_budget: Duration,
    /// Failures within the window that trigger quarantine.
    pub lockout_fails: u32,
    /// Window over which failures are counted.
    pub lockout_window: Duration,
    /// How long a quarantined slave is skipped.
    pub lockout_duration: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(1),
            pulse_budget: Duration::from_secs(2),
            lockout_fails: 5,
            lockout_window: Duration::from_secs(300),
            lockout_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct SlaveHealth {
    failures: VecDeque<Instant>,
    quarantined_until: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    pulses_ok: AtomicU64,
    pulses_failed: AtomicU64,
    timeouts: AtomicU64,
    crc_mismatches: AtomicU64,
    exceptions: AtomicU64,
    io_errors: AtomicU64,
}

#[derive(Default, Clone)]
struct SlaveStats {
    pulses: u64,
    failures: u64,
    total_ms: u64,
    max_ms: u64,
}

/// Per-slave pulse statistics for the metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SlaveMetrics {
    pub pulses: u64,
    pub failures: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// Point-in-time pipeline metrics, embedded in health and heartbeat
/// telemetry payloads.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub pulses_ok: u64,
    pub pulses_failed: u64,
    pub timeouts: u64,
    pub crc_mismatches: u64,
    pub exceptions: u64,
    pub io_errors: u64,
    pub connection_lost: bool,
    pub quarantined_slaves: Vec<u8>,
    pub per_slave: BTreeMap<u8, SlaveMetrics>,
}

/// Result of one locker within an `open_all` run.
#[derive(Debug)]
pub struct OpenOutcome {
    pub locker_id: i64,
    pub result: Result<(), PipelineError>,
}

/// The relay actuation pipeline. One instance per gateway.
pub struct Pipeline {
    bus: BusTransport,
    config: Arc<ConfigManager>,
    settings: PipelineSettings,
    bus_lock: Mutex<()>,
    lockouts: Mutex<HashMap<u8, SlaveHealth>>,
    counters: Counters,
    per_slave: Mutex<HashMap<u8, SlaveStats>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(bus: BusTransport, config: Arc<ConfigManager>, settings: PipelineSettings) -> Self {
        Self {
            bus,
            config,
            settings,
            bus_lock: Mutex::new(()),
            lockouts: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            per_slave: Mutex::new(HashMap::new()),
        }
    }

    /// Fire one coil pulse: ON, hold, OFF.
    ///
    /// The OFF write is attempted even when the ON write failed: the relay
    /// may have fired despite a lost reply, and a latched coil would keep
    /// the solenoid energized.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Map`] if the locker cannot be addressed.
    /// - [`PipelineError::Quarantined`] if the slave is locked out.
    /// - [`PipelineError::Hardware`] when retries exhaust.
    pub async fn pulse(
        &self,
        locker_id: i64,
        hold_override: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let cfg = self.config.snapshot().await;
        let addr = map_locker(locker_id, &cfg.doc)?;
        self.ensure_not_quarantined(addr.slave).await?;

        let hold = hold_override.unwrap_or(Duration::from_millis(cfg.doc.timing.pulse_ms));

        let guard = self.bus_lock.lock().await;
        let started = Instant::now();
        let deadline = started + self.settings.pulse_budget;

        let on = self.write_coil_with_retry(addr.slave, addr.coil, true, deadline).await;
        tokio::time::sleep(hold).await;
        let off = self.write_coil_with_retry(addr.slave, addr.coil, false, deadline).await;
        drop(guard);

        let elapsed = started.elapsed();
        let outcome = match (on, off) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) | (Err(e), _) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.record_success(addr.slave, elapsed).await;
                debug!(locker_id, slave = addr.slave, coil = addr.coil, ms = elapsed.as_millis() as u64, "pulse ok");
                Ok(())
            }
            Err(e) => {
                self.record_failure(addr.slave, &e, elapsed).await;
                warn!(locker_id, slave = addr.slave, coil = addr.coil, error = %e, "pulse failed");
                Err(PipelineError::Hardware {
                    slave: addr.slave,
                    source: e,
                })
            }
        }
    }

    /// Pulse repeatedly until one succeeds or the burst window closes.
    ///
    /// Returns the number of pulses issued on success.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::BurstExhausted`] when no pulse succeeded.
    /// - [`PipelineError::Quarantined`] as soon as the slave locks out.
    pub async fn burst(
        &self,
        locker_id: i64,
        total_override: Option<Duration>,
        interval_override: Option<Duration>,
    ) -> Result<u32, PipelineError> {
        let cfg = self.config.snapshot().await;
        let total = total_override.unwrap_or(Duration::from_millis(cfg.doc.timing.burst_ms));
        let interval =
            interval_override.unwrap_or(Duration::from_millis(cfg.doc.timing.burst_interval_ms));

        let started = Instant::now();
        let deadline = started + total;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match self.pulse(locker_id, None).await {
                Ok(()) => {
                    info!(locker_id, attempts, "burst succeeded");
                    return Ok(attempts);
                }
                Err(e @ (PipelineError::Quarantined { .. } | PipelineError::Map(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    debug!(locker_id, attempts, error = %e, "burst pulse failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let next = started + interval * attempts;
            if next >= deadline {
                // Let the window run out so a burst takes its full length.
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(next).await;
        }

        Err(PipelineError::BurstExhausted { locker_id, attempts })
    }

    /// Pulse a list of lockers sequentially with the configured gap between
    /// them. Never parallel; one bad locker does not stop the rest.
    pub async fn open_all(
        &self,
        locker_ids: &[i64],
        interval_override: Option<Duration>,
    ) -> Vec<OpenOutcome> {
        let cfg = self.config.snapshot().await;
        let gap = interval_override
            .unwrap_or(Duration::from_millis(cfg.doc.timing.command_interval_ms));

        let mut outcomes = Vec::with_capacity(locker_ids.len());
        for (i, &locker_id) in locker_ids.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(gap).await;
            }
            let result = self.pulse(locker_id, None).await;
            outcomes.push(OpenOutcome { locker_id, result });
        }
        outcomes
    }

    /// Emergency: force all 16 coils of a card off in one frame.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Hardware`] if the write fails.
    pub async fn all_relays_off(&self, slave: u8) -> Result<(), PipelineError> {
        let _guard = self.bus_lock.lock().await;
        self.bus
            .write_multiple_coils(slave, 1, &[false; COILS_PER_CARD as usize], None)
            .await
            .map_err(|e| PipelineError::Hardware { slave, source: e })
    }

    /// Slaves currently under quarantine.
    pub async fn quarantined_slaves(&self) -> Vec<u8> {
        let now = Instant::now();
        let lockouts = self.lockouts.lock().await;
        let mut slaves: Vec<u8> = lockouts
            .iter()
            .filter(|(_, h)| h.quarantined_until.is_some_and(|until| until > now))
            .map(|(&slave, _)| slave)
            .collect();
        slaves.sort_unstable();
        slaves
    }

    /// Current metrics.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let per_slave = self.per_slave.lock().await;
        let per_slave = per_slave
            .iter()
            .map(|(&slave, s)| {
                (
                    slave,
                    SlaveMetrics {
                        pulses: s.pulses,
                        failures: s.failures,
                        avg_ms: if s.pulses == 0 { 0 } else { s.total_ms / s.pulses },
                        max_ms: s.max_ms,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            pulses_ok: self.counters.pulses_ok.load(Ordering::Relaxed),
            pulses_failed: self.counters.pulses_failed.load(Ordering::Relaxed),
            timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            crc_mismatches: self.counters.crc_mismatches.load(Ordering::Relaxed),
            exceptions: self.counters.exceptions.load(Ordering::Relaxed),
            io_errors: self.counters.io_errors.load(Ordering::Relaxed),
            connection_lost: self.bus.connection_lost(),
            quarantined_slaves: self.quarantined_slaves().await,
            per_slave,
        }
    }

    async fn write_coil_with_retry(
        &self,
        slave: u8,
        coil: u16,
        on: bool,
        deadline: Instant,
    ) -> Result<(), BusError> {
        let mut backoff = self.settings.retry_base;
        let mut last = BusError::Timeout;

        for attempt in 1..=self.settings.max_retries.max(1) {
            match self.bus.write_single_coil(slave, coil, on, None).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(slave, coil, on, attempt, error = %e, "coil write failed");
                    last = e;
                }
            }
            if attempt >= self.settings.max_retries || Instant::now() + backoff >= deadline {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.settings.retry_cap);
        }

        Err(last)
    }

    async fn ensure_not_quarantined(&self, slave: u8) -> Result<(), PipelineError> {
        let now = Instant::now();
        let mut lockouts = self.lockouts.lock().await;
        if let Some(health) = lockouts.get_mut(&slave) {
            match health.quarantined_until {
                Some(until) if until > now => {
                    return Err(PipelineError::Quarantined { slave });
                }
                Some(_) => {
                    // Lockout elapsed; give the slave a clean slate.
                    lockouts.remove(&slave);
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn record_success(&self, slave: u8, elapsed: Duration) {
        self.counters.pulses_ok.fetch_add(1, Ordering::Relaxed);
        self.lockouts.lock().await.remove(&slave);

        let mut per_slave = self.per_slave.lock().await;
        let stats = per_slave.entry(slave).or_default();
        stats.pulses += 1;
        let ms = elapsed.as_millis() as u64;
        stats.total_ms += ms;
        stats.max_ms = stats.max_ms.max(ms);
    }

    async fn record_failure(&self, slave: u8, error: &BusError, elapsed: Duration) {
        self.counters.pulses_failed.fetch_add(1, Ordering::Relaxed);
        match error {
            BusError::Timeout => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            BusError::Frame(FrameError::CrcMismatch { .. }) => {
                self.counters.crc_mismatches.fetch_add(1, Ordering::Relaxed);
            }
            BusError::Frame(FrameError::Exception { .. }) => {
                self.counters.exceptions.fetch_add(1, Ordering::Relaxed);
            }
            BusError::Io { .. } | BusError::WorkerGone | BusError::Frame(_) => {
                self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let mut per_slave = self.per_slave.lock().await;
            let stats = per_slave.entry(slave).or_default();
            stats.pulses += 1;
            stats.failures += 1;
            let ms = elapsed.as_millis() as u64;
            stats.total_ms += ms;
            stats.max_ms = stats.max_ms.max(ms);
        }

        let now = Instant::now();
        let mut lockouts = self.lockouts.lock().await;
        let health = lockouts.entry(slave).or_default();
        health.failures.push_back(now);
        while health
            .failures
            .front()
            .is_some_and(|&t| now.duration_since(t) > self.settings.lockout_window)
        {
            health.failures.pop_front();
        }
        if health.failures.len() >= self.settings.lockout_fails as usize
            && health.quarantined_until.is_none()
        {
            health.quarantined_until = Some(now + self.settings.lockout_duration);
            health.failures.clear();
            warn!(
                slave,
                lockout_secs = self.settings.lockout_duration.as_secs(),
                "slave quarantined after repeated failures"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSettings, MockFault, MockPort};
    use crate::frame::Request;
    use lockerd_store::Store;

    async fn pipeline_with_zones() -> (Pipeline, MockPort) {
        let store = Store::open_in_memory().await.unwrap();
        let config = Arc::new(ConfigManager::load(store).await.unwrap());
        let doc: crate::config::ConfigDocument = serde_json::from_str(
            r#"{
                "features": { "zones_enabled": true },
                "zones": [
                    { "id": "mens",   "ranges": [[1,32]],  "relay_cards": [1,2] },
                    { "id": "womens", "ranges": [[33,64]], "relay_cards": [3,4] }
                ]
            }"#,
        )
        .unwrap();
        config.deploy(doc).await.unwrap();

        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), BusSettings::default());
        let pipeline = Pipeline::new(bus, config, PipelineSettings::default());
        (pipeline, port)
    }

    #[tokio::test]
    async fn pulse_sends_exactly_one_on_and_one_off_frame() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();

        pipeline.pulse(5, None).await.unwrap();

        let log = port.requests().await;
        assert_eq!(
            log,
            vec![
                Request::WriteSingleCoil { slave: 1, coil: 5, on: true },
                Request::WriteSingleCoil { slave: 1, coil: 5, on: false },
            ]
        );
    }

    #[tokio::test]
    async fn cross_zone_locker_maps_to_the_right_card() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();

        pipeline.pulse(49, None).await.unwrap();

        let log = port.requests().await;
        assert_eq!(log[0], Request::WriteSingleCoil { slave: 4, coil: 1, on: true });
    }

    #[tokio::test]
    async fn pulse_width_stays_within_tolerance() {
        let (pipeline, _port) = pipeline_with_zones().await;
        tokio::time::pause();

        let started = Instant::now();
        pipeline.pulse(5, None).await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(350), "pulse too short: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(450), "pulse too long: {elapsed:?}");
    }

    #[tokio::test]
    async fn transient_timeout_is_retried_transparently() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();
        port.push_fault(MockFault::Timeout).await;

        pipeline.pulse(5, None).await.unwrap();

        // Two ON attempts (first timed out), one OFF.
        let log = port.requests().await;
        assert_eq!(log.len(), 3);
        assert_eq!(log[2], Request::WriteSingleCoil { slave: 1, coil: 5, on: false });
        assert_eq!(pipeline.metrics().await.pulses_ok, 1);
    }

    #[tokio::test]
    async fn off_is_attempted_even_when_on_times_out() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();
        port.kill_slave(1).await;

        let err = pipeline.pulse(5, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Hardware { slave: 1, .. }));

        let log = port.requests().await;
        assert!(
            matches!(log.last(), Some(Request::WriteSingleCoil { on: false, .. })),
            "best-effort OFF missing: {log:?}"
        );
    }

    #[tokio::test]
    async fn repeated_failures_quarantine_the_slave_only() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();
        port.kill_slave(1).await;

        for _ in 0..5 {
            let _ = pipeline.pulse(5, None).await;
        }

        let frames_before = port.requests().await.len();
        let err = pipeline.pulse(5, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Quarantined { slave: 1 }));
        // Fail-fast: no frames hit the bus.
        assert_eq!(port.requests().await.len(), frames_before);
        assert_eq!(pipeline.quarantined_slaves().await, vec![1]);

        // Another slave is unaffected.
        pipeline.pulse(33, None).await.unwrap();
    }

    #[tokio::test]
    async fn quarantine_expires_after_the_lockout_duration() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();
        port.kill_slave(1).await;
        for _ in 0..5 {
            let _ = pipeline.pulse(5, None).await;
        }
        assert_eq!(pipeline.quarantined_slaves().await, vec![1]);

        port.revive_slave(1).await;
        tokio::time::sleep(Duration::from_secs(301)).await;

        pipeline.pulse(5, None).await.unwrap();
        assert!(pipeline.quarantined_slaves().await.is_empty());
    }

    #[tokio::test]
    async fn burst_returns_on_first_success() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();
        port.push_fault(MockFault::Timeout).await;

        let attempts = pipeline.burst(5, None, None).await.unwrap();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_burst_takes_its_full_window() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();
        port.kill_slave(1).await;

        let started = Instant::now();
        let err = pipeline.burst(5, None, None).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, PipelineError::BurstExhausted { locker_id: 5, .. }));
        assert!(elapsed >= Duration::from_secs(9), "burst too short: {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(11), "burst too long: {elapsed:?}");
    }

    #[tokio::test]
    async fn open_all_is_sequential_with_gaps() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();

        let started = Instant::now();
        let outcomes = pipeline.open_all(&[1, 2, 3], None).await;
        let elapsed = started.elapsed();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(port.requests().await.len(), 6);
        // Two inter-command gaps of 300 ms plus three ~400 ms pulses.
        assert!(elapsed >= Duration::from_millis(1700), "too fast: {elapsed:?}");
    }

    #[tokio::test]
    async fn all_relays_off_uses_one_multi_coil_frame() {
        let (pipeline, port) = pipeline_with_zones().await;
        tokio::time::pause();

        pipeline.all_relays_off(2).await.unwrap();

        let log = port.requests().await;
        assert_eq!(log.len(), 1);
        assert!(matches!(
            &log[0],
            Request::WriteMultipleCoils { slave: 2, first_coil: 1, bits } if bits.len() == 16 && bits.iter().all(|b| !b)
        ));
    }
}
