//! Native Energy Measurement Backend core.
//!
//! A low-overhead, high-precision system that attributes energy
//! consumption to named regions of an instrumented program. A hot path
//! ([`mark`](EnergyMeter::mark)) stamps named markers at sub-microsecond
//! cost; a background polling thread continuously samples hardware energy
//! counters at a fixed cadence into a lock-free ring buffer. After
//! execution, markers are correlated against the buffered energy time
//! series via interpolation to produce per-region energy attributions.
//!
//! The crate is organized into:
//! - **error**: unified error taxonomy (`NembError` and friends)
//! - **model**: data types shared across every other module
//! - **timer**: `PrecisionTimer`, the monotonic nanosecond time source
//! - **ring_buffer**: the lock-free synchronized-reading store
//! - **provider**: the `EnergyProvider` contract, counter-unwrap/integration
//!   arithmetic, and the reference CPU/GPU providers
//! - **marker**: thread-local hot-path marker capture
//! - **diagnostics**: the non-blocking diagnostics channel and self-calibration
//! - **config**: `MeasurementConfig`
//! - **coordinator**: the background `MeasurementCoordinator`
//! - **meter**: the `EnergyMeter` facade, correlation algorithm, and the
//!   crate's public entry point

#![allow(dead_code)]

pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod marker;
pub mod meter;
pub mod model;
pub mod provider;
pub mod ring_buffer;
pub mod timer;

// Re-export the log crate for macro usage by external callers wiring up
// their own logger.
pub use log;

pub use config::MeasurementConfig;
pub use coordinator::MeasurementCoordinator;
pub use error::{NembError, Result};
pub use meter::{measure, EnergyMeter, Handle};
pub use model::{
    CorrelatedCheckpoint, Domain, EnergyReading, HardwareKind, HealthState, Marker,
    ProviderCapabilities, ProviderHealth, ProviderId, Spec, SynchronizedReading, Timestamp,
};
pub use provider::{create as create_provider, EnergyProvider};
pub use ring_buffer::RingBuffer;
pub use timer::{ClockSource, PrecisionTimer};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_constant_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn error_reexport_is_accessible() {
        let _: Result<i32> = Ok(42);
    }

    #[test]
    fn model_reexports_are_accessible() {
        let _kind = HardwareKind::Cpu;
        let _health = ProviderHealth::default();
    }

    #[test]
    fn measure_with_no_providers_configured_fails_construction() {
        let config = MeasurementConfig::default();
        let result = measure(config);
        assert!(result.is_err());
    }
}
