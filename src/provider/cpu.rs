//! CPU-style cumulative-energy provider (§4.2.a): an Intel RAPL-style MSR
//! energy counter read via `/dev/cpu/<n>/msr`.
//!
//! Grounded on `system/performance/diagnostic.rs::MsrReader`'s
//! open-with-graceful-degradation pattern (seek to an MSR address, read 8
//! bytes little-endian, degrade to `handle: None` rather than fail
//! construction) and `hardware/cpu.rs`'s `/proc/cpuinfo` vendor scan.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use crate::error::ProviderError;
use crate::model::{EnergyReading, HardwareKind, ProviderCapabilities, ProviderId, Spec};
use crate::provider::{CounterUnwrapper, EnergyProvider, DEFAULT_POLL_TIMEOUT};

/// `MSR_PKG_ENERGY_STATUS`: package-domain cumulative energy (32-bit LSB
/// count in register bits 31:0).
const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
/// `MSR_PP0_ENERGY_STATUS`: cores-domain cumulative energy.
const MSR_PP0_ENERGY_STATUS: u64 = 0x639;
/// `MSR_DRAM_ENERGY_STATUS`: dram-domain cumulative energy, not present on
/// all platforms.
const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;
/// `MSR_RAPL_POWER_UNIT`: low 4 bits give `energy_units = 1 / 2^x` joules.
const MSR_RAPL_POWER_UNIT: u64 = 0x606;

const COUNTER_BIT_WIDTH: u32 = 32;

fn is_intel_cpu() -> bool {
    if let Ok(content) = fs::read_to_string("/proc/cpuinfo") {
        for line in content.lines() {
            if line.starts_with("vendor_id") {
                if let Some(vendor) = line.split(": ").nth(1) {
                    return vendor.trim() == "GenuineIntel";
                }
            }
        }
    }
    false
}

/// Thin wrapper over the `/dev/cpu/<n>/msr` character device. `None`
/// means the interface is unavailable (no `msr` module, insufficient
/// privilege, non-Intel vendor); every subsequent read then fails, and the
/// provider degrades to `valid = false` rather than erroring.
struct MsrHandle {
    file: Option<fs::File>,
}

impl MsrHandle {
    fn open(cpu_id: u32) -> Self {
        if !is_intel_cpu() {
            return MsrHandle { file: None };
        }
        let path = format!("/dev/cpu/{cpu_id}/msr");
        match fs::OpenOptions::new().read(true).open(&path) {
            Ok(file) => MsrHandle { file: Some(file) },
            Err(_) => MsrHandle { file: None },
        }
    }

    fn read_u64(&mut self, address: u64) -> Option<u64> {
        let file = self.file.as_mut()?;
        file.seek(SeekFrom::Start(address)).ok()?;
        let mut buf = [0u8; 8];
        file.read_exact(&mut buf).ok()?;
        Some(u64::from_le_bytes(buf))
    }

    fn is_available(&self) -> bool {
        self.file.is_some()
    }
}

struct DomainUnwrapper {
    address: u64,
    unwrapper: CounterUnwrapper,
}

/// Reference CPU-package provider: reads package/cores/dram RAPL energy
/// MSRs on Intel platforms, degrading to permanently-invalid readings when
/// the MSR interface is unavailable.
pub struct CpuPackageProvider {
    id: ProviderId,
    handle: Option<MsrHandle>,
    energy_resolution_joules: f64,
    package: Option<DomainUnwrapper>,
    cores: Option<DomainUnwrapper>,
    dram: Option<DomainUnwrapper>,
    spec: Option<Spec>,
}

impl CpuPackageProvider {
    pub fn new(id: ProviderId) -> Self {
        CpuPackageProvider {
            id,
            handle: None,
            energy_resolution_joules: 1.0 / (1u64 << 16) as f64,
            package: None,
            cores: None,
            dram: None,
            spec: None,
        }
    }

    fn domain_present(handle: &mut MsrHandle, address: u64) -> bool {
        handle.read_u64(address).is_some()
    }

    fn poll_domain(
        handle: &mut MsrHandle,
        slot: &mut Option<DomainUnwrapper>,
        timestamp_ns: u64,
        resolution: f64,
    ) -> Option<(f64, f64, bool)> {
        let domain = slot.as_mut()?;
        let raw = handle.read_u64(domain.address)?;
        let raw_lsb = raw & 0xFFFF_FFFF;
        let (energy, power, wrapped) = domain.unwrapper.record(timestamp_ns, raw_lsb, resolution);
        Some((energy, power, wrapped))
    }
}

impl EnergyProvider for CpuPackageProvider {
    fn initialize(&mut self) -> Result<Spec, ProviderError> {
        let deadline = Instant::now() + DEFAULT_POLL_TIMEOUT;
        let mut handle = MsrHandle::open(0);

        let mut resolution = self.energy_resolution_joules;
        if let Some(units_raw) = handle.read_u64(MSR_RAPL_POWER_UNIT) {
            let energy_units_field = units_raw & 0x1F;
            resolution = 1.0 / (1u64 << energy_units_field) as f64;
        }
        self.energy_resolution_joules = resolution;

        if Instant::now() > deadline {
            return Err(ProviderError::InitializationTimeout {
                provider_id: self.id.clone(),
                timeout: DEFAULT_POLL_TIMEOUT,
            });
        }

        let mut domains = Vec::new();
        if Self::domain_present(&mut handle, MSR_PKG_ENERGY_STATUS) {
            domains.push("package".to_string());
            self.package = Some(DomainUnwrapper {
                address: MSR_PKG_ENERGY_STATUS,
                unwrapper: CounterUnwrapper::new(COUNTER_BIT_WIDTH),
            });
        }
        if Self::domain_present(&mut handle, MSR_PP0_ENERGY_STATUS) {
            domains.push("cores".to_string());
            self.cores = Some(DomainUnwrapper {
                address: MSR_PP0_ENERGY_STATUS,
                unwrapper: CounterUnwrapper::new(COUNTER_BIT_WIDTH),
            });
        }
        if Self::domain_present(&mut handle, MSR_DRAM_ENERGY_STATUS) {
            domains.push("dram".to_string());
            self.dram = Some(DomainUnwrapper {
                address: MSR_DRAM_ENERGY_STATUS,
                unwrapper: CounterUnwrapper::new(COUNTER_BIT_WIDTH),
            });
        }

        let available = handle.is_available();
        self.handle = Some(handle);

        let spec = Spec {
            provider_id: self.id.clone(),
            vendor: "intel".to_string(),
            hardware_type: HardwareKind::Cpu,
            domains,
            min_poll_interval_ns: Duration::from_millis(1).as_nanos() as u64,
            counter_bit_width: COUNTER_BIT_WIDTH,
            energy_resolution_joules: resolution,
            typical_overhead_percent: 0.1,
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
        let handle = match self.handle.as_mut() {
            Some(h) if h.is_available() => h,
            _ => return EnergyReading::invalid(timestamp_ns),
        };

        let resolution = self.energy_resolution_joules;
        let package = Self::poll_domain(handle, &mut self.package, timestamp_ns, resolution);
        let cores = Self::poll_domain(handle, &mut self.cores, timestamp_ns, resolution);
        let dram = Self::poll_domain(handle, &mut self.dram, timestamp_ns, resolution);

        if package.is_none() && cores.is_none() && dram.is_none() {
            return EnergyReading::invalid(timestamp_ns);
        }

        let mut per_domain = std::collections::HashMap::new();
        let mut wrapped = false;
        let mut total = 0.0;
        // §4.2 derived power is package-domain power when available, falling
        // back to cores/dram the same way the package energy total does.
        let mut power = f64::NAN;
        if let Some((energy, p, w)) = package {
            per_domain.insert("package".to_string(), energy);
            total += energy;
            wrapped |= w;
            power = p;
        }
        if let Some((energy, p, w)) = cores {
            per_domain.insert("cores".to_string(), energy);
            wrapped |= w;
            if power.is_nan() {
                power = p;
            }
        }
        if let Some((energy, p, w)) = dram {
            per_domain.insert("dram".to_string(), energy);
            wrapped |= w;
            if power.is_nan() {
                power = p;
            }
        }

        EnergyReading {
            timestamp_ns,
            energy_joules: total,
            instantaneous_power_watts: power,
            per_domain_energy_joules: per_domain,
            uncertainty_percent: 5.0,
            counter_wrapped: wrapped,
            valid: true,
        }
    }

    fn shutdown(&mut self) {
        self.handle = None;
    }

    fn specification(&self) -> Spec {
        self.spec.clone().unwrap_or_else(|| Spec {
            provider_id: self.id.clone(),
            vendor: "intel".to_string(),
            hardware_type: HardwareKind::Cpu,
            domains: Vec::new(),
            min_poll_interval_ns: Duration::from_millis(1).as_nanos() as u64,
            counter_bit_width: COUNTER_BIT_WIDTH,
            energy_resolution_joules: self.energy_resolution_joules,
            typical_overhead_percent: 0.1,
            capabilities: ProviderCapabilities::default(),
        })
    }
}
