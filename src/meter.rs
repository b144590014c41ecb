//! `EnergyMeter` facade and the offline marker/energy correlation algorithm
//! (§4.5), plus the crate's public entry point `measure()` and its `Handle`
//! (§6).
//!
//! The correlation step's bracket-search-then-interpolate shape mirrors the
//! reference codebase's `LatencyProcessor` bucketing approach in
//! `system/performance/collector.rs`: precompute nothing on the hot path,
//! do the numerically interesting work once, offline, against a snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::MeasurementConfig;
use crate::coordinator::MeasurementCoordinator;
use crate::error::{NembError, Result};
use crate::model::{CorrelatedCheckpoint, Marker, ProviderId, SynchronizedReading};
use crate::timer::PrecisionTimer;

/// Facade owning the coordinator and the precision timer shared with the
/// hot path. Not constructed directly by callers; see [`measure`].
pub struct EnergyMeter {
    coordinator: Arc<MeasurementCoordinator>,
    timer: Arc<PrecisionTimer>,
}

impl EnergyMeter {
    fn new(coordinator: Arc<MeasurementCoordinator>) -> Self {
        let timer = coordinator.timer();
        EnergyMeter { coordinator, timer }
    }

    /// Hot path entry (§4.5 steps 1-5). Captures the timestamp first, then
    /// delegates to the thread-local marker log.
    pub fn mark(&self, name: &str) {
        let started = self.timer.now_ns();
        crate::marker::record_mark(name, started);
        let overhead = self.timer.now_ns().saturating_sub(started);
        self.coordinator.record_mark_overhead(overhead);
    }

    pub fn read_now(&self) -> Option<SynchronizedReading> {
        self.coordinator.latest()
    }

    /// Correlates every recorded marker against a snapshot of the ring
    /// buffer, per §4.5's binary-search-and-interpolate algorithm.
    pub fn checkpoints(&self) -> Vec<CorrelatedCheckpoint> {
        let snapshot = self.coordinator.snapshot();
        let markers = crate::marker::merge_all();
        let bracket_window = self.coordinator.bracket_window().as_nanos() as f64;
        let timer_confidence = self.timer.confidence_factor();
        let buffer_wrapped = self.coordinator.buffer_wrapped();

        markers
            .iter()
            .map(|marker| correlate_one(marker, &snapshot, bracket_window, timer_confidence, buffer_wrapped))
            .collect()
    }

    /// `energy_between(a, b)` (§4.5): defined only when both markers exist
    /// among the currently recorded checkpoints.
    pub fn energy_between(&self, name_a: &str, name_b: &str) -> f64 {
        let checkpoints = self.checkpoints();
        let a = checkpoints.iter().find(|c| c.name == name_a);
        let b = checkpoints.iter().find(|c| c.name == name_b);
        match (a, b) {
            (Some(a), Some(b)) => {
                let delta = b.cumulative_energy_joules - a.cumulative_energy_joules;
                if delta < 0.0 {
                    self.coordinator
                        .emit_negative_interval_energy(name_a, name_b);
                    0.0
                } else {
                    delta
                }
            }
            _ => 0.0,
        }
    }

    pub fn diagnostics(&self) -> HashMap<String, String> {
        self.coordinator.diagnostics_snapshot().to_map()
    }

    pub fn active_providers(&self) -> Vec<ProviderId> {
        self.coordinator.active_providers()
    }
}

/// Correlates a single marker against a sorted reading snapshot (§4.5
/// steps 2-3).
fn correlate_one(
    marker: &Marker,
    snapshot: &[SynchronizedReading],
    bracket_window_ns: f64,
    timer_confidence: f64,
    buffer_wrapped: bool,
) -> CorrelatedCheckpoint {
    if snapshot.is_empty() {
        return CorrelatedCheckpoint {
            name: marker.name.clone(),
            timestamp_ns: marker.timestamp_ns,
            cumulative_energy_joules: 0.0,
            per_provider_cumulative: HashMap::new(),
            confidence: 0.0,
        };
    }

    let t_m = marker.timestamp_ns;
    // Binary search for the bracketing pair by common_timestamp_ns.
    let idx = snapshot.partition_point(|r| r.common_timestamp_ns <= t_m);

    if idx == 0 {
        // Marker at or before the earliest retained reading. Two distinct
        // cases collapse to the same index here (§4.4, §8 scenario 6):
        // if the ring buffer has never wrapped, the earliest retained
        // reading really is the first reading ever taken, so this is the
        // ordinary pre-first-reading case (confidence 0.5). If the buffer
        // has wrapped, earlier readings that would have bracketed this
        // marker were overwritten, so the marker is older than the
        // retained window and confidence must be 0.
        let r = &snapshot[0];
        let confidence = if buffer_wrapped { 0.0 } else { 0.5 * timer_confidence };
        return CorrelatedCheckpoint {
            name: marker.name.clone(),
            timestamp_ns: t_m,
            cumulative_energy_joules: r.total_energy_joules,
            per_provider_cumulative: r.total_energy_per_provider(),
            confidence,
        };
    }
    if idx == snapshot.len() {
        // Marker after the last reading: use it with ratio-1 semantics.
        let r = &snapshot[snapshot.len() - 1];
        return CorrelatedCheckpoint {
            name: marker.name.clone(),
            timestamp_ns: t_m,
            cumulative_energy_joules: r.total_energy_joules,
            per_provider_cumulative: r.total_energy_per_provider(),
            confidence: 0.5 * timer_confidence,
        };
    }

    let r1 = &snapshot[idx - 1];
    let r2 = &snapshot[idx];

    if r1.common_timestamp_ns == t_m {
        // Exact knot; interpolation is exact per §8's round-trip law.
        return CorrelatedCheckpoint {
            name: marker.name.clone(),
            timestamp_ns: t_m,
            cumulative_energy_joules: r1.total_energy_joules,
            per_provider_cumulative: r1.total_energy_per_provider(),
            confidence: 1.0 * timer_confidence,
        };
    }

    let gap_ns = (r2.common_timestamp_ns - r1.common_timestamp_ns) as f64;
    let ratio = (t_m - r1.common_timestamp_ns) as f64 / gap_ns;

    let cumulative_energy_joules =
        r1.total_energy_joules + ratio * (r2.total_energy_joules - r1.total_energy_joules);

    let mut per_provider_cumulative = HashMap::new();
    let p1 = r1.total_energy_per_provider();
    let p2 = r2.total_energy_per_provider();
    for (provider_id, e1) in &p1 {
        if let Some(e2) = p2.get(provider_id) {
            per_provider_cumulative.insert(provider_id.clone(), e1 + ratio * (e2 - e1));
        }
    }

    let mut confidence = if gap_ns <= bracket_window_ns {
        1.0
    } else {
        let ten_times = bracket_window_ns * 10.0;
        (1.0 - (gap_ns - bracket_window_ns) / (ten_times - bracket_window_ns)).clamp(0.0, 1.0)
    };
    confidence *= timer_confidence;

    let any_wrapped = r1
        .readings
        .values()
        .chain(r2.readings.values())
        .any(|reading| reading.counter_wrapped);
    if any_wrapped {
        confidence *= 0.5;
    }

    CorrelatedCheckpoint {
        name: marker.name.clone(),
        timestamp_ns: t_m,
        cumulative_energy_joules,
        per_provider_cumulative,
        confidence,
    }
}

/// Handle returned by [`measure`]: owns the meter and coordinator for the
/// lifetime of a measurement session (§6). Dropping it shuts everything
/// down; `shutdown()` may also be called explicitly and is idempotent.
pub struct Handle {
    meter: EnergyMeter,
    shut_down: AtomicBool,
}

impl Handle {
    fn reject_if_shutdown(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(NembError::AlreadyShutdown)
        } else {
            Ok(())
        }
    }

    pub fn mark(&self, name: &str) -> Result<()> {
        self.reject_if_shutdown()?;
        self.meter.mark(name);
        Ok(())
    }

    pub fn read_now(&self) -> Result<Option<SynchronizedReading>> {
        self.reject_if_shutdown()?;
        Ok(self.meter.read_now())
    }

    pub fn checkpoints(&self) -> Result<Vec<CorrelatedCheckpoint>> {
        self.reject_if_shutdown()?;
        Ok(self.meter.checkpoints())
    }

    pub fn energy_between(&self, name_a: &str, name_b: &str) -> Result<f64> {
        self.reject_if_shutdown()?;
        Ok(self.meter.energy_between(name_a, name_b))
    }

    pub fn diagnostics(&self) -> Result<HashMap<String, String>> {
        self.reject_if_shutdown()?;
        Ok(self.meter.diagnostics())
    }

    pub fn active_providers(&self) -> Result<Vec<ProviderId>> {
        self.reject_if_shutdown()?;
        Ok(self.meter.active_providers())
    }

    /// Idempotent: a second call is a no-op (§8 round-trip law). Stops the
    /// polling thread first; any in-flight `checkpoints()` call completes
    /// against the last snapshot taken before the stop (§9's resolved open
    /// question on shutdown ordering).
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.meter.coordinator.stop();
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Constructs a measurement session: initializes every configured
/// provider, starts the polling thread, and returns a [`Handle`] (§6).
/// Fails only at construction time, per §7's propagation policy — every
/// error that can occur after this point is absorbed into diagnostics.
///
/// Clears any markers left over from a prior session (§3: "cleared when a
/// new session begins") before the new coordinator is constructed, so a
/// fresh `Handle` always starts from an empty marker log. A process is
/// expected to run one measurement session at a time; overlapping
/// `measure()` calls share the same process-wide marker registry (§9) and
/// will observe each other's markers.
pub fn measure(config: MeasurementConfig) -> Result<Handle> {
    crate::marker::clear_all();

    let providers: Vec<Box<dyn crate::provider::EnergyProvider>> = config
        .preferred_providers
        .iter()
        .chain(config.required_providers.iter())
        .filter_map(|id| crate::provider::create(id))
        .collect();

    let coordinator = MeasurementCoordinator::new(config, providers)?;
    coordinator.start();
    let coordinator = Arc::new(coordinator);

    Ok(Handle {
        meter: EnergyMeter::new(coordinator),
        shut_down: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnergyReading;
    use std::collections::HashMap as Map;

    fn reading(ts: u64, energy: f64) -> SynchronizedReading {
        let mut readings = Map::new();
        readings.insert(
            "synthetic.0".to_string(),
            EnergyReading {
                timestamp_ns: ts,
                energy_joules: energy,
                instantaneous_power_watts: 0.0,
                per_domain_energy_joules: Map::new(),
                uncertainty_percent: 0.0,
                counter_wrapped: false,
                valid: true,
            },
        );
        SynchronizedReading {
            common_timestamp_ns: ts,
            readings,
            total_energy_joules: energy,
        }
    }

    #[test]
    fn bracketed_interpolation_is_linear() {
        let snapshot = vec![reading(0, 0.0), reading(1000, 10.0)];
        let marker = Marker { name: "m".to_string(), timestamp_ns: 500 };
        let checkpoint = correlate_one(&marker, &snapshot, 10_000.0, 1.0, false);
        assert!((checkpoint.cumulative_energy_joules - 5.0).abs() < 1e-9);
        assert!((checkpoint.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn marker_before_first_reading_gets_half_confidence() {
        let snapshot = vec![reading(1000, 10.0), reading(2000, 20.0)];
        let marker = Marker { name: "m".to_string(), timestamp_ns: 0 };
        let checkpoint = correlate_one(&marker, &snapshot, 10_000.0, 1.0, false);
        assert_eq!(checkpoint.cumulative_energy_joules, 10.0);
        assert_eq!(checkpoint.confidence, 0.5);
    }

    /// §4.4: "If the marker is older than the retained window, correlation
    /// returns confidence=0" (§8 scenario 6). This differs from the
    /// pre-first-reading case above only in whether the ring buffer has
    /// ever overwritten an entry.
    #[test]
    fn marker_evicted_by_overwrite_gets_zero_confidence() {
        let snapshot = vec![reading(1000, 10.0), reading(2000, 20.0)];
        let marker = Marker { name: "m".to_string(), timestamp_ns: 0 };
        let checkpoint = correlate_one(&marker, &snapshot, 10_000.0, 1.0, true);
        assert_eq!(checkpoint.cumulative_energy_joules, 10.0);
        assert_eq!(checkpoint.confidence, 0.0);
    }

    #[test]
    fn empty_buffer_yields_zero_confidence_and_energy() {
        let marker = Marker { name: "m".to_string(), timestamp_ns: 0 };
        let checkpoint = correlate_one(&marker, &[], 10_000.0, 1.0, false);
        assert_eq!(checkpoint.confidence, 0.0);
        assert_eq!(checkpoint.cumulative_energy_joules, 0.0);
    }

    #[test]
    fn interpolation_is_exact_at_knots() {
        let snapshot = vec![reading(0, 0.0), reading(1000, 10.0), reading(2000, 25.0)];
        let marker = Marker { name: "m".to_string(), timestamp_ns: 1000 };
        let checkpoint = correlate_one(&marker, &snapshot, 10_000.0, 1.0, false);
        assert!((checkpoint.cumulative_energy_joules - 10.0).abs() < 1e-9);
        assert!((checkpoint.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wide_gap_reduces_confidence_below_one() {
        let snapshot = vec![reading(0, 0.0), reading(200_000, 10.0)];
        let marker = Marker { name: "m".to_string(), timestamp_ns: 100_000 };
        let checkpoint = correlate_one(&marker, &snapshot, 10_000.0, 1.0, false);
        assert!(checkpoint.confidence < 1.0);
        assert!(checkpoint.confidence >= 0.0);
    }

    #[test]
    fn wrapped_bracket_halves_confidence() {
        let mut r1 = reading(0, 0.0);
        r1.readings.get_mut("synthetic.0").unwrap().counter_wrapped = true;
        let r2 = reading(1000, 10.0);
        let marker = Marker { name: "m".to_string(), timestamp_ns: 500 };
        let checkpoint = correlate_one(&marker, &[r1, r2], 10_000.0, 1.0, false);
        assert!((checkpoint.confidence - 0.5).abs() < 1e-9);
    }
}
