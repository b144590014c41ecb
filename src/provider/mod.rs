//! `EnergyProvider` contract: the capability-polymorphic hardware
//! abstraction every energy source implements, plus the shared
//! counter-unwrap/derived-power arithmetic (§4.2) and the static
//! `ProviderId -> factory` registry (§9's "tagged enum... static registry"
//! redesign note, replacing a virtual inheritance hierarchy).

pub mod cpu;
pub mod gpu;

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::ProviderError;
use crate::model::{EnergyReading, ProviderId, Spec, Timestamp};

/// Default per-poll deadline (§4.4's `provider_poll_timeout`).
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Threshold below which a decreasing raw counter is treated as a wrap
/// rather than a hardware reset (§4.2).
pub const DEFAULT_WRAP_RESET_THRESHOLD: Duration = Duration::from_secs(1);

/// Capability-polymorphic hardware energy source. Implementors never let
/// errors escape `poll()`; a failed read degrades to `valid = false` per
/// §7's propagation policy.
pub trait EnergyProvider: Send {
    /// Idempotent. Must complete within a configured timeout. Calling this
    /// twice must return an equivalent `Spec` (§8 round-trip law).
    fn initialize(&mut self) -> Result<Spec, ProviderError>;

    /// Must complete in bounded wall time. `timestamp_ns` is the shared
    /// `PrecisionTimer` reading the coordinator captured once for this tick
    /// (§4.4 step 3) — providers never read their own clock, both so every
    /// provider in a tick is synchronized to the same instant and so a
    /// provider's `poll()` never pays `PrecisionTimer::new()`'s calibration
    /// cost on the hot polling path. Returns `valid = false` with
    /// `timestamp_ns` preserved on transient failure; never panics, never
    /// blocks indefinitely.
    fn poll(&mut self, timestamp_ns: Timestamp) -> EnergyReading;

    /// Idempotent.
    fn shutdown(&mut self);

    fn specification(&self) -> Spec;

    fn provider_id(&self) -> ProviderId {
        self.specification().provider_id
    }
}

/// Shared counter-unwrap and derived-power bookkeeping (§4.2), reused by
/// both reference providers so the unwrap arithmetic is implemented and
/// tested exactly once.
#[derive(Debug)]
pub struct CounterUnwrapper {
    bit_width: u32,
    reset_threshold: Duration,
    last_raw: Option<u64>,
    baseline: Option<u64>,
    accumulated: u64,
    last_reading: Option<(Timestamp, f64)>,
}

impl CounterUnwrapper {
    pub fn new(bit_width: u32) -> Self {
        CounterUnwrapper {
            bit_width,
            reset_threshold: DEFAULT_WRAP_RESET_THRESHOLD,
            last_raw: None,
            baseline: None,
            accumulated: 0,
            last_reading: None,
        }
    }

    pub fn with_reset_threshold(mut self, threshold: Duration) -> Self {
        self.reset_threshold = threshold;
        self
    }

    /// Feeds one new raw counter value and returns the unwrapped
    /// `(energy_lsb_since_baseline, wrapped)` pair. `elapsed_since_last`
    /// is `None` on the very first call.
    fn unwrap_raw(&mut self, raw: u64, elapsed_since_last: Option<Duration>) -> (u64, bool) {
        let mut wrapped = false;
        match self.last_raw {
            None => {
                self.accumulated = raw;
                self.baseline = Some(raw);
            }
            Some(last) => {
                if raw < last {
                    let elapsed = elapsed_since_last.unwrap_or(Duration::MAX);
                    if elapsed < self.reset_threshold {
                        let span = 1u128 << self.bit_width;
                        let delta = (span - last as u128) + raw as u128;
                        self.accumulated = self.accumulated.wrapping_add(delta as u64);
                        wrapped = true;
                    } else {
                        // Counter reset, not a wrap: start over from zero.
                        self.accumulated = 0;
                        self.baseline = Some(raw.wrapping_sub(raw));
                        self.last_raw = Some(raw);
                        return (0, false);
                    }
                } else {
                    let delta = raw - last;
                    self.accumulated = self.accumulated.wrapping_add(delta);
                }
            }
        }
        self.last_raw = Some(raw);
        (self.accumulated.wrapping_sub(self.baseline.unwrap_or(0)), wrapped)
    }

    /// Full pipeline for one poll: unwrap the raw counter, scale to
    /// joules, and derive instantaneous power from the previous reading.
    /// `resolution_joules_per_lsb` must be applied *after* unwrap, never
    /// before — unwrapping a pre-scaled float silently breaks wrap
    /// detection when the scaled delta rounds to zero (§4.2.a).
    pub fn record(
        &mut self,
        timestamp_ns: Timestamp,
        raw_counter: u64,
        resolution_joules_per_lsb: f64,
    ) -> (f64, f64, bool) {
        let elapsed = self
            .last_reading
            .map(|(last_ts, _)| Duration::from_nanos(timestamp_ns.saturating_sub(last_ts)));
        let (lsb_accumulated, wrapped) = self.unwrap_raw(raw_counter, elapsed);
        let energy_joules = lsb_accumulated as f64 * resolution_joules_per_lsb;

        let power = match self.last_reading {
            Some((last_ts, last_energy)) if timestamp_ns > last_ts => {
                (energy_joules - last_energy) / Duration::from_nanos(timestamp_ns - last_ts).as_secs_f64()
            }
            _ => f64::NAN,
        };

        self.last_reading = Some((timestamp_ns, energy_joules));
        (energy_joules, power, wrapped)
    }
}

/// Trapezoidal-integration energy accumulator for power-sampled providers
/// (§4.2.b). Maintains a rolling sum so integration is O(1) per poll;
/// retains only the most recent `N` raw samples (default 4096, §9 open
/// question) so it can recompute after a provider restart without
/// unbounded memory growth.
#[derive(Debug)]
pub struct TrapezoidalIntegrator {
    retained: std::collections::VecDeque<(Timestamp, f64)>,
    retain_limit: usize,
    rolling_energy_joules: f64,
}

/// Default sample retention for the GPU integrator (§9 open question).
pub const DEFAULT_INTEGRATOR_RETENTION: usize = 4096;

impl TrapezoidalIntegrator {
    pub fn new() -> Self {
        TrapezoidalIntegrator {
            retained: std::collections::VecDeque::with_capacity(DEFAULT_INTEGRATOR_RETENTION),
            retain_limit: DEFAULT_INTEGRATOR_RETENTION,
            rolling_energy_joules: 0.0,
        }
    }

    /// Appends one `(timestamp_ns, power_watts)` sample and returns the
    /// cumulative energy since the integrator started.
    pub fn record(&mut self, timestamp_ns: Timestamp, power_watts: f64) -> f64 {
        if let Some(&(prev_ts, prev_power)) = self.retained.back() {
            if timestamp_ns > prev_ts {
                let dt = Duration::from_nanos(timestamp_ns - prev_ts).as_secs_f64();
                self.rolling_energy_joules += 0.5 * (prev_power + power_watts) * dt;
            }
        }
        self.retained.push_back((timestamp_ns, power_watts));
        if self.retained.len() > self.retain_limit {
            self.retained.pop_front();
        }
        self.rolling_energy_joules
    }
}

impl Default for TrapezoidalIntegrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory signature for the provider registry (§6's plugin interface: the
/// `EnergyProvider` trait plus a `create(id) -> Option<Provider>` factory).
pub type ProviderFactory = fn(&str) -> Option<Box<dyn EnergyProvider>>;

fn registry_entries() -> HashMap<&'static str, ProviderFactory> {
    let mut map: HashMap<&'static str, ProviderFactory> = HashMap::new();
    map.insert("cpu.package", |id| Some(Box::new(cpu::CpuPackageProvider::new(id.to_string()))));
    map.insert("cpu.cores", |id| Some(Box::new(cpu::CpuPackageProvider::new(id.to_string()))));
    map.insert("cpu.dram", |id| Some(Box::new(cpu::CpuPackageProvider::new(id.to_string()))));
    map.insert("gpu", |id| Some(Box::new(gpu::GpuPowerProvider::new(id.to_string()))));
    map
}

/// Static `ProviderId prefix -> factory` registry (§4.2 ambient addition).
/// Out-of-tree providers can implement the same `create(id) -> Option<..>`
/// factory shape without needing to touch this registry's source (§6).
pub static PROVIDER_REGISTRY: Lazy<HashMap<&'static str, ProviderFactory>> =
    Lazy::new(registry_entries);

/// Looks up a factory for `id` by matching the longest registered prefix
/// and constructs a provider, or returns `None` if `id` matches no known
/// provider family.
pub fn create(id: &str) -> Option<Box<dyn EnergyProvider>> {
    PROVIDER_REGISTRY
        .iter()
        .filter(|(prefix, _)| id.starts_with(**prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .and_then(|(_, factory)| factory(id))
}
