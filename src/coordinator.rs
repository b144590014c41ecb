//! `MeasurementCoordinator` (§4.4): owns providers, drives the background
//! polling loop, maintains the ring buffer, and tracks provider health.
//!
//! Grounded on `system/performance/collector.rs::LatencyCollector::run`'s
//! absolute-time (`clock_nanosleep(TIMER_ABSTIME)`) tick loop with a
//! stop-flag check and dropped/spike atomics, and on
//! `system/performance/watchdog.rs`'s heartbeat/restart-backoff shape for
//! the unhealthy-provider restart policy. The non-blocking diagnostics
//! channel follows `system/performance/diagnostic_buffer.rs::DiagnosticBuffer`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::MeasurementConfig;
use crate::diagnostics::{
    last_overrun_ns_from, provider_notes_from, DiagnosticEvent, DiagnosticsChannel,
    DiagnosticsSnapshot, SelfCalibration, TickCounters,
};
use crate::error::CoordinatorError;
use crate::model::{HealthState, ProviderHealth, ProviderId, SynchronizedReading};
use crate::provider::EnergyProvider;
use crate::ring_buffer::RingBuffer;
use crate::timer::PrecisionTimer;

struct OwnedProvider {
    id: ProviderId,
    provider: Box<dyn EnergyProvider>,
    health: ProviderHealth,
}

/// Background polling coordinator. Construction initializes the timer and
/// every configured provider; `start()` spawns the single dedicated
/// polling thread described in §5.
pub struct MeasurementCoordinator {
    config: MeasurementConfig,
    timer: Arc<PrecisionTimer>,
    ring_buffer: Arc<RingBuffer>,
    diagnostics: Arc<DiagnosticsChannel>,
    tick_counters: Arc<TickCounters>,
    self_calibration: Arc<Mutex<SelfCalibration>>,
    active_provider_ids: Vec<ProviderId>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    /// Providers are moved into the worker thread on `start()`; held here
    /// only between construction and `start()`.
    pending_providers: Mutex<Option<Vec<OwnedProvider>>>,
}

impl MeasurementCoordinator {
    /// Initializes the timer and each configured provider. Per §4.4,
    /// init errors mark a provider disabled rather than failing
    /// construction, unless it was named in `required_providers` or zero
    /// providers initialized at all.
    pub fn new(
        config: MeasurementConfig,
        providers: Vec<Box<dyn EnergyProvider>>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let timer = Arc::new(PrecisionTimer::new().map_err(|e| {
            CoordinatorError::InvalidConfig(format!("timer unavailable: {e}"))
        })?);

        let mut owned = Vec::new();
        for mut provider in providers {
            let id_before_init = provider.provider_id();
            match provider.initialize() {
                Ok(spec) => {
                    owned.push(OwnedProvider {
                        id: spec.provider_id,
                        provider,
                        health: ProviderHealth::default(),
                    });
                }
                Err(_) => {
                    if config.required_providers.contains(&id_before_init) {
                        return Err(CoordinatorError::RequiredProviderUnavailable(id_before_init));
                    }
                }
            }
        }

        for required in &config.required_providers {
            if !owned.iter().any(|p| &p.id == required) {
                return Err(CoordinatorError::RequiredProviderUnavailable(required.clone()));
            }
        }

        if owned.is_empty() {
            return Err(CoordinatorError::NoProvidersAvailable);
        }

        let active_provider_ids = owned.iter().map(|p| p.id.clone()).collect();
        let ring_buffer = Arc::new(RingBuffer::new(config.buffer_capacity));

        Ok(MeasurementCoordinator {
            config,
            timer,
            ring_buffer,
            diagnostics: Arc::new(DiagnosticsChannel::start()),
            tick_counters: Arc::new(TickCounters::default()),
            self_calibration: Arc::new(Mutex::new(SelfCalibration::new())),
            active_provider_ids,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            pending_providers: Mutex::new(Some(owned)),
        })
    }

    /// Starts the single dedicated polling thread. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return; // already running
        }
        let Some(owned) = self.pending_providers.lock().expect("pending providers mutex poisoned").take() else {
            // start() called again after providers were already handed to
            // a previous worker thread (e.g. start/stop/start); nothing
            // to do, the coordinator was already torn down once.
            self.running.store(false, Ordering::Release);
            return;
        };

        let config = self.config.clone();
        let timer = self.timer.clone();
        let ring_buffer = self.ring_buffer.clone();
        let diagnostics = self.diagnostics.clone();
        let tick_counters = self.tick_counters.clone();
        let self_calibration = self.self_calibration.clone();
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name("nemb-poll".to_string())
            .spawn(move || {
                run_poll_loop(
                    config,
                    timer,
                    ring_buffer,
                    diagnostics,
                    tick_counters,
                    self_calibration,
                    running,
                    owned,
                );
            })
            .expect("failed to spawn measurement polling thread");

        *self.worker.lock().expect("worker mutex poisoned") = Some(handle);
    }

    /// Signals the polling thread to exit and joins it. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().expect("worker mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    pub fn active_providers(&self) -> Vec<ProviderId> {
        self.active_provider_ids.clone()
    }

    pub fn snapshot(&self) -> Vec<SynchronizedReading> {
        self.ring_buffer.snapshot()
    }

    /// True once the ring buffer has overwritten at least one entry
    /// (§4.3's `wrapped` flag), consumed by correlation (§4.4, §4.5) to
    /// distinguish a marker older than the retained window from an
    /// ordinary pre-first-reading marker.
    pub fn buffer_wrapped(&self) -> bool {
        self.ring_buffer.has_wrapped()
    }

    /// Returns the most recent tick, blocking up to 2x `measurement_interval`
    /// if none is available yet.
    pub fn latest(&self) -> Option<SynchronizedReading> {
        let deadline = std::time::Instant::now() + self.config.measurement_interval * 2;
        loop {
            if let Some(reading) = self.ring_buffer.snapshot().into_iter().last() {
                return Some(reading);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_micros(100));
        }
    }

    pub fn bracket_window(&self) -> Duration {
        self.config.bracket_window
    }

    pub fn timer(&self) -> Arc<PrecisionTimer> {
        self.timer.clone()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        let snapshot = self.ring_buffer.snapshot();
        let calibration = self.self_calibration.lock().expect("self-calibration mutex poisoned");
        DiagnosticsSnapshot {
            timer_source: self.timer.source(),
            active_providers: self.active_provider_ids.clone(),
            provider_notes: provider_notes_from(&self.diagnostics),
            tick_count: self.tick_counters.tick_count.load(Ordering::Relaxed),
            missed_tick_count: self.tick_counters.missed_tick_count.load(Ordering::Relaxed),
            buffer_fill: snapshot.len(),
            buffer_capacity: self.ring_buffer.capacity(),
            buffer_wrapped: self.ring_buffer.has_wrapped(),
            mark_overhead_p99_ns: calibration.mark_overhead_p99(),
            tick_jitter_p99_ns: calibration.tick_jitter_p99(),
            last_tick_overrun_ns: last_overrun_ns_from(&self.diagnostics),
        }
    }

    /// Emits §4.5's `CorrelationAmbiguity` diagnostic when
    /// `energy_between` would otherwise return a negative value.
    pub fn emit_negative_interval_energy(&self, name_a: &str, name_b: &str) {
        self.diagnostics.emit(DiagnosticEvent::NegativeIntervalEnergy {
            name_a: name_a.to_string(),
            name_b: name_b.to_string(),
        });
    }

    pub fn record_mark_overhead(&self, ns: u64) {
        self.self_calibration
            .lock()
            .expect("self-calibration mutex poisoned")
            .record_mark_overhead(ns);
    }

    pub fn mark_overhead_p99(&self) -> f64 {
        self.self_calibration
            .lock()
            .expect("self-calibration mutex poisoned")
            .mark_overhead_p99()
    }
}

impl Drop for MeasurementCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_poll_loop(
    config: MeasurementConfig,
    timer: Arc<PrecisionTimer>,
    ring_buffer: Arc<RingBuffer>,
    diagnostics: Arc<DiagnosticsChannel>,
    tick_counters: Arc<TickCounters>,
    self_calibration: Arc<Mutex<SelfCalibration>>,
    running: Arc<AtomicBool>,
    mut providers: Vec<OwnedProvider>,
) {
    let interval_ns = config.measurement_interval.as_nanos() as u64;
    let mut next_wake = timer.now_ns();
    let mut last_wake: Option<u64> = None;

    while running.load(Ordering::Acquire) {
        timer.sleep_until_ns(next_wake);
        let t = timer.now_ns();

        if let Some(last) = last_wake {
            let jitter = t.saturating_sub(last).saturating_sub(interval_ns);
            self_calibration
                .lock()
                .expect("self-calibration mutex poisoned")
                .record_tick_jitter(jitter);
        }
        last_wake = Some(t);

        let overrun = t.saturating_sub(next_wake);
        if overrun > 0 {
            diagnostics.emit(DiagnosticEvent::TickOverran { overrun_ns: overrun });
        }

        let mut readings = HashMap::new();
        let mut total_energy = 0.0;

        for owned in providers.iter_mut() {
            if !owned.health.is_healthy() {
                continue;
            }
            if !running.load(Ordering::Acquire) {
                break;
            }

            let reading = poll_with_timeout(owned.provider.as_mut(), t, config.provider_poll_timeout);
            if reading.valid {
                owned.health.record_valid();
                total_energy += reading.energy_joules;
            } else {
                let was_healthy = owned.health.is_healthy();
                owned.health.record_invalid();
                if was_healthy && !owned.health.is_healthy() {
                    diagnostics.emit(DiagnosticEvent::ProviderUnhealthy {
                        provider_id: owned.id.clone(),
                        consecutive_failures: owned.health.consecutive_failures,
                    });
                }
            }
            readings.insert(owned.id.clone(), reading);
        }

        ring_buffer.push(SynchronizedReading {
            common_timestamp_ns: t,
            readings,
            total_energy_joules: total_energy,
        });
        tick_counters.record_tick();

        if config.auto_restart_unhealthy {
            let restart_deadline = std::time::Instant::now() + config.measurement_interval / 4;
            for owned in providers.iter_mut() {
                if std::time::Instant::now() >= restart_deadline {
                    break;
                }
                if owned.health.state != HealthState::Unhealthy {
                    continue;
                }
                let elapsed_since_restart = owned
                    .health
                    .last_restart_attempt_ns
                    .map(|last| Duration::from_nanos(t.saturating_sub(last)))
                    .unwrap_or(config.restart_interval);
                if elapsed_since_restart < config.restart_interval {
                    continue;
                }
                owned.health.last_restart_attempt_ns = Some(t);
                let success = owned.provider.initialize().is_ok();
                diagnostics.emit(DiagnosticEvent::ProviderRestarted {
                    provider_id: owned.id.clone(),
                    success,
                });
                if success {
                    owned.health = ProviderHealth::default();
                }
            }
        }

        next_wake += interval_ns;
        if next_wake < t {
            // Overran badly enough that the next boundary is already in
            // the past; schedule the nearest future boundary instead of
            // bursting to catch up (§4.4 step 6).
            tick_counters.record_missed();
            let missed_periods = (t - next_wake) / interval_ns + 1;
            next_wake += missed_periods * interval_ns;
        }
    }

    for owned in providers.iter_mut() {
        owned.provider.shutdown();
    }
}

fn poll_with_timeout(
    provider: &mut dyn EnergyProvider,
    timestamp_ns: u64,
    timeout: Duration,
) -> crate::model::EnergyReading {
    let started = std::time::Instant::now();
    let reading = provider.poll(timestamp_ns);
    if started.elapsed() > timeout {
        crate::model::EnergyReading::invalid(reading.timestamp_ns)
    } else {
        reading
    }
}
