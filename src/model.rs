//! Core data types shared across the crate: the wire-level shapes produced
//! by providers, the coordinator, and the meter's correlation step.
//!
//! Mirrors the reference codebase's practice (`src/models.rs`) of keeping
//! record types plain, `Clone`, and `Serialize`-derived so a downstream
//! collaborator (reporting, persistence) can consume them without a
//! translation layer — the core itself never serializes anything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Monotonic nanosecond timestamp, process-local, since an arbitrary fixed
/// epoch. Strictly non-decreasing within a process.
pub type Timestamp = u64;

/// Short stable string naming a provider instance, e.g. `"cpu.package.0"`,
/// `"gpu.0"`.
pub type ProviderId = String;

/// String sub-component key within a provider, e.g. `"package"`, `"cores"`,
/// `"dram"`, `"uncore"`.
pub type Domain = String;

/// Hardware family a provider speaks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareKind {
    Cpu,
    Gpu,
    Synthetic,
}

/// Capability flags a provider may report in its `Spec`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub temperature: bool,
    pub frequency: bool,
    pub power_limit: bool,
}

/// Static description of a provider, returned by `initialize()` and
/// `specification()`. Calling `initialize()` twice must yield an
/// equivalent `Spec` (§8 round-trip law).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub provider_id: ProviderId,
    pub vendor: String,
    pub hardware_type: HardwareKind,
    pub domains: Vec<Domain>,
    pub min_poll_interval_ns: u64,
    pub counter_bit_width: u32,
    pub energy_resolution_joules: f64,
    pub typical_overhead_percent: f64,
    pub capabilities: ProviderCapabilities,
}

/// One provider's reading at a single poll.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnergyReading {
    pub timestamp_ns: Timestamp,
    pub energy_joules: f64,
    pub instantaneous_power_watts: f64,
    pub per_domain_energy_joules: HashMap<Domain, f64>,
    pub uncertainty_percent: f64,
    pub counter_wrapped: bool,
    pub valid: bool,
}

impl EnergyReading {
    /// A reading that failed; carries a best-effort timestamp per §4.2.
    pub fn invalid(timestamp_ns: Timestamp) -> Self {
        EnergyReading {
            timestamp_ns,
            energy_joules: 0.0,
            instantaneous_power_watts: f64::NAN,
            per_domain_energy_joules: HashMap::new(),
            uncertainty_percent: 100.0,
            counter_wrapped: false,
            valid: false,
        }
    }
}

/// One coordinator tick: all providers' readings synchronized to a single
/// `PrecisionTimer` timestamp taken immediately before polling them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SynchronizedReading {
    pub common_timestamp_ns: Timestamp,
    pub readings: HashMap<ProviderId, EnergyReading>,
    pub total_energy_joules: f64,
}

impl SynchronizedReading {
    pub fn total_energy_per_provider(&self) -> HashMap<ProviderId, f64> {
        self.readings
            .iter()
            .filter(|(_, r)| r.valid)
            .map(|(id, r)| (id.clone(), r.energy_joules))
            .collect()
    }
}

/// A named, timestamped point emitted by application code on the hot path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Marker {
    pub name: String,
    pub timestamp_ns: Timestamp,
}

/// A marker correlated against the buffered energy time series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrelatedCheckpoint {
    pub name: String,
    pub timestamp_ns: Timestamp,
    pub cumulative_energy_joules: f64,
    pub per_provider_cumulative: HashMap<ProviderId, f64>,
    pub confidence: f64,
}

/// Per-provider health state tracked by the coordinator (§4.4 ambient
/// addition): the unhealthy/restart decision is a coordinator concern, not
/// a provider concern, so this lives outside the provider trait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Clone, Debug)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,
    pub state: HealthState,
    pub last_restart_attempt_ns: Option<Timestamp>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        ProviderHealth {
            consecutive_failures: 0,
            state: HealthState::Healthy,
            last_restart_attempt_ns: None,
        }
    }
}

/// Consecutive invalid polls before a provider is marked unhealthy (§4.2).
pub const UNHEALTHY_THRESHOLD: u32 = 5;

impl ProviderHealth {
    pub fn record_valid(&mut self) {
        self.consecutive_failures = 0;
        self.state = HealthState::Healthy;
    }

    pub fn record_invalid(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD {
            self.state = HealthState::Unhealthy;
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_health_marks_unhealthy_after_threshold() {
        let mut health = ProviderHealth::default();
        for _ in 0..UNHEALTHY_THRESHOLD - 1 {
            health.record_invalid();
            assert!(health.is_healthy());
        }
        health.record_invalid();
        assert!(!health.is_healthy());
    }

    #[test]
    fn provider_health_recovers_on_valid_read() {
        let mut health = ProviderHealth::default();
        for _ in 0..UNHEALTHY_THRESHOLD {
            health.record_invalid();
        }
        assert!(!health.is_healthy());
        health.record_valid();
        assert!(health.is_healthy());
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn invalid_reading_preserves_timestamp() {
        let reading = EnergyReading::invalid(12345);
        assert_eq!(reading.timestamp_ns, 12345);
        assert!(!reading.valid);
        assert!(reading.instantaneous_power_watts.is_nan());
    }

    /// `checkpoints()` output is plain `Serialize` data (§6): the core
    /// never serializes it itself, but an external reporting/persistence
    /// collaborator must be able to round-trip it through `serde_json`
    /// without a translation layer.
    #[test]
    fn correlated_checkpoint_round_trips_through_json() {
        let checkpoint = CorrelatedCheckpoint {
            name: "region#inv_1_t7".to_string(),
            timestamp_ns: 500_000,
            cumulative_energy_joules: 5.0,
            per_provider_cumulative: HashMap::from([("cpu.package.0".to_string(), 5.0)]),
            confidence: 1.0,
        };
        let json = serde_json::to_string(&checkpoint).expect("checkpoint must serialize");
        let restored: CorrelatedCheckpoint =
            serde_json::from_str(&json).expect("checkpoint must deserialize");
        assert_eq!(restored.name, checkpoint.name);
        assert_eq!(restored.cumulative_energy_joules, checkpoint.cumulative_energy_joules);
    }
}
