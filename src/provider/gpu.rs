//! GPU-style power-integrated provider (§4.2.b): reads instantaneous power
//! from a `hwmon` `power1_input` file and integrates trapezoidally.
//!
//! Grounded on `system/performance/thermal.rs`'s hwmon-directory-scan-with-
//! name-match fallback chain (coretemp -> k10temp -> generic hwmon),
//! adapted from an array of temperature sensors to a single
//! instantaneous-power sensor; vendor matching follows
//! `hardware/gpu.rs`'s vendor-name style.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::ProviderError;
use crate::model::{EnergyReading, HardwareKind, ProviderCapabilities, ProviderId, Spec};
use crate::provider::{EnergyProvider, TrapezoidalIntegrator, DEFAULT_POLL_TIMEOUT};

/// Known GPU hwmon driver names to match against `/sys/class/hwmon/*/name`.
const GPU_HWMON_DRIVERS: &[&str] = &["amdgpu", "nouveau", "nvidia"];

fn find_gpu_power_sensor() -> Option<(PathBuf, String)> {
    let hwmon_dir = Path::new("/sys/class/hwmon");
    if !hwmon_dir.exists() {
        return None;
    }
    let entries = fs::read_dir(hwmon_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = fs::read_to_string(path.join("name")).ok()?;
        let name = name.trim().to_string();
        if GPU_HWMON_DRIVERS.contains(&name.as_str()) && path.join("power1_input").exists() {
            return Some((path, name));
        }
    }
    None
}

fn read_power_watts(sensor_dir: &Path) -> Option<f64> {
    let content = fs::read_to_string(sensor_dir.join("power1_input")).ok()?;
    let microwatts: f64 = content.trim().parse().ok()?;
    Some(microwatts / 1_000_000.0)
}

/// Reference GPU provider: integrates an instantaneous-power hwmon sensor
/// into cumulative energy. Degrades to permanently-invalid readings when
/// no GPU power sensor is present (proprietary driver without hwmon power
/// support, or no discrete GPU at all).
pub struct GpuPowerProvider {
    id: ProviderId,
    sensor_dir: Option<PathBuf>,
    vendor: String,
    integrator: TrapezoidalIntegrator,
    spec: Option<Spec>,
}

impl GpuPowerProvider {
    pub fn new(id: ProviderId) -> Self {
        GpuPowerProvider {
            id,
            sensor_dir: None,
            vendor: "unknown".to_string(),
            integrator: TrapezoidalIntegrator::new(),
            spec: None,
        }
    }
}

impl EnergyProvider for GpuPowerProvider {
    fn initialize(&mut self) -> Result<Spec, ProviderError> {
        let deadline = Instant::now() + DEFAULT_POLL_TIMEOUT;
        let found = find_gpu_power_sensor();
        if Instant::now() > deadline {
            return Err(ProviderError::InitializationTimeout {
                provider_id: self.id.clone(),
                timeout: DEFAULT_POLL_TIMEOUT,
            });
        }

        let (domains, vendor, available) = match found {
            Some((dir, vendor)) => {
                self.sensor_dir = Some(dir);
                (vec!["power".to_string()], vendor, true)
            }
            None => (Vec::new(), "unknown".to_string(), false),
        };
        self.vendor = vendor.clone();

        let spec = Spec {
            provider_id: self.id.clone(),
            vendor,
            hardware_type: HardwareKind::Gpu,
            domains,
            min_poll_interval_ns: std::time::Duration::from_millis(1).as_nanos() as u64,
            counter_bit_width: 0,
            energy_resolution_joules: 1e-6,
            typical_overhead_percent: 0.2,
            capabilities: ProviderCapabilities {
                temperature: false,
                frequency: false,
                power_limit: available,
            },
        };
        self.spec = Some(spec.clone());
        Ok(spec)
    }

    fn poll(&mut self, timestamp_ns: u64) -> EnergyReading {
        let sensor_dir = match self.sensor_dir.as_ref() {
            Some(dir) => dir,
            None => return EnergyReading::invalid(timestamp_ns),
        };
        let power_watts = match read_power_watts(sensor_dir) {
            Some(w) => w,
            None => return EnergyReading::invalid(timestamp_ns),
        };

        let cumulative = self.integrator.record(timestamp_ns, power_watts);

        let mut per_domain = std::collections::HashMap::new();
        per_domain.insert("power".to_string(), cumulative);

        EnergyReading {
            timestamp_ns,
            energy_joules: cumulative,
            instantaneous_power_watts: power_watts,
            per_domain_energy_joules: per_domain,
            uncertainty_percent: 8.0,
            counter_wrapped: false,
            valid: true,
        }
    }

    fn shutdown(&mut self) {
        self.sensor_dir = None;
    }

    fn specification(&self) -> Spec {
        self.spec.clone().unwrap_or_else(|| Spec {
            provider_id: self.id.clone(),
            vendor: self.vendor.clone(),
            hardware_type: HardwareKind::Gpu,
            domains: Vec::new(),
            min_poll_interval_ns: std::time::Duration::from_millis(1).as_nanos() as u64,
            counter_bit_width: 0,
            energy_resolution_joules: 1e-6,
            typical_overhead_percent: 0.2,
            capabilities: ProviderCapabilities::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_never_fails_without_a_gpu_sensor() {
        let mut provider = GpuPowerProvider::new("gpu.0".to_string());
        assert!(provider.initialize().is_ok());
    }

    #[test]
    fn poll_without_sensor_is_invalid() {
        let mut provider = GpuPowerProvider::new("gpu.0".to_string());
        provider.initialize().unwrap();
        let reading = provider.poll(1_000_000);
        if provider.sensor_dir.is_none() {
            assert!(!reading.valid);
        }
    }

    #[test]
    fn shutdown_clears_sensor_and_is_idempotent() {
        let mut provider = GpuPowerProvider::new("gpu.0".to_string());
        provider.initialize().unwrap();
        provider.shutdown();
        provider.shutdown();
        assert!(provider.sensor_dir.is_none());
    }
}
