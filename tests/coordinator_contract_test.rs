//! Drives `MeasurementCoordinator` against a synthetic `EnergyProvider`
//! implemented outside the crate, the way an out-of-tree provider author
//! would (§6's plugin interface: implement the trait, nothing more).

use std::collections::HashMap;
use std::time::Duration;

use nemb_core::config::MeasurementConfig;
use nemb_core::error::ProviderError;
use nemb_core::model::{EnergyReading, HardwareKind, ProviderCapabilities, Spec};
use nemb_core::{EnergyProvider, MeasurementCoordinator};

/// A provider that counts up a fixed amount of energy every poll and
/// never fails, used to confirm the coordinator's tick/snapshot plumbing
/// without depending on any real hardware being present in CI.
struct CountingProvider {
    id: String,
    joules_per_tick: f64,
    emitted: f64,
}

impl CountingProvider {
    fn new(id: &str, joules_per_tick: f64) -> Self {
        CountingProvider {
            id: id.to_string(),
            joules_per_tick,
            emitted: 0.0,
        }
    }
}

impl EnergyProvider for CountingProvider {
    fn initialize(&mut self) -> Result<Spec, ProviderError> {
        Ok(self.specification())
    }

    fn poll(&mut self, timestamp_ns: u64) -> EnergyReading {
        self.emitted += self.joules_per_tick;
        EnergyReading {
            timestamp_ns,
            energy_joules: self.emitted,
            instantaneous_power_watts: self.joules_per_tick / 0.001,
            per_domain_energy_joules: HashMap::new(),
            uncertainty_percent: 0.0,
            counter_wrapped: false,
            valid: true,
        }
    }

    fn shutdown(&mut self) {}

    fn specification(&self) -> Spec {
        Spec {
            provider_id: self.id.clone(),
            vendor: "synthetic".to_string(),
            hardware_type: HardwareKind::Synthetic,
            domains: Vec::new(),
            min_poll_interval_ns: 1_000_000,
            counter_bit_width: 0,
            energy_resolution_joules: 1.0,
            typical_overhead_percent: 0.0,
            capabilities: ProviderCapabilities::default(),
        }
    }
}

#[test]
fn coordinator_polls_synthetic_provider_into_ring_buffer() {
    let mut config = MeasurementConfig::default();
    config.measurement_interval = Duration::from_millis(1);

    let coordinator =
        MeasurementCoordinator::new(config, vec![Box::new(CountingProvider::new("synthetic.0", 1.0))])
            .expect("construction with a healthy provider must succeed");

    assert_eq!(coordinator.active_providers(), vec!["synthetic.0".to_string()]);

    coordinator.start();
    std::thread::sleep(Duration::from_millis(50));
    coordinator.stop();

    let snapshot = coordinator.snapshot();
    assert!(!snapshot.is_empty(), "polling loop must have produced at least one tick");
    for w in snapshot.windows(2) {
        assert!(w[0].common_timestamp_ns < w[1].common_timestamp_ns);
    }
    // Cumulative energy must be non-decreasing tick over tick.
    for w in snapshot.windows(2) {
        assert!(w[1].total_energy_joules >= w[0].total_energy_joules);
    }

    let diagnostics = coordinator.diagnostics_snapshot().to_map();
    assert!(diagnostics.get("tick_count").unwrap().parse::<u64>().unwrap() > 0);
}

#[test]
fn construction_requires_at_least_one_successfully_initialized_provider() {
    let config = MeasurementConfig::default();
    let result = MeasurementCoordinator::new(config, Vec::new());
    assert!(result.is_err());
}

#[test]
fn stop_is_idempotent_and_safe_to_call_before_start() {
    let config = MeasurementConfig::default();
    let coordinator =
        MeasurementCoordinator::new(config, vec![Box::new(CountingProvider::new("synthetic.0", 1.0))])
            .unwrap();
    coordinator.stop();
    coordinator.stop();
}

/// §8 scenario 6, scaled down for a test suite: a small ring buffer
/// overwhelmed by many more ticks than it can retain must never crash,
/// must keep its retained window strictly ordered, and must report
/// `buffer_wrapped = true` in diagnostics.
#[test]
fn overwrite_under_pressure_keeps_snapshot_ordered_and_reports_wrap() {
    let mut config = MeasurementConfig::default();
    config.measurement_interval = Duration::from_millis(1);
    config.buffer_capacity = 16;

    let coordinator =
        MeasurementCoordinator::new(config, vec![Box::new(CountingProvider::new("synthetic.0", 1.0))])
            .unwrap();
    coordinator.start();
    std::thread::sleep(Duration::from_millis(200));
    coordinator.stop();

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.len(), 16, "retained window must be exactly the configured capacity once overwhelmed");
    for w in snapshot.windows(2) {
        assert!(w[0].common_timestamp_ns < w[1].common_timestamp_ns);
    }

    let diagnostics = coordinator.diagnostics_snapshot().to_map();
    assert_eq!(diagnostics.get("buffer_wrapped").unwrap(), "true");
}
