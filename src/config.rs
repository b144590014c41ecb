//! `MeasurementConfig` (§2 ambient component 8, §3, §4.4, §6).
//!
//! A plain struct with a `Default` impl, validated at construction time,
//! in the same style as the reference codebase's many per-subsystem
//! `*Config` structs (`WatchdogConfig`, `PerformanceConfig`). Derives
//! `Serialize`/`Deserialize` purely so an external caller can embed it in
//! its own (out-of-scope) configuration file — this crate never reads or
//! writes one itself.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;
use crate::model::ProviderId;

/// Legal range for `measurement_interval` (§4.4).
pub const MIN_MEASUREMENT_INTERVAL: Duration = Duration::from_millis(1);
pub const MAX_MEASUREMENT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Target poll period. Legal range 1ms-100ms (default 1ms).
    pub measurement_interval: Duration,
    /// Ring buffer size; must be a power of two (default 131072).
    pub buffer_capacity: usize,
    /// Whether to restart providers that exceeded the unhealthy threshold.
    pub auto_restart_unhealthy: bool,
    /// Minimum wait between restart attempts for a given provider.
    pub restart_interval: Duration,
    /// Maximum gap between a marker and its bracketing readings for
    /// full-confidence interpolation. Defaults to 10x `measurement_interval`.
    pub bracket_window: Duration,
    /// Per-provider per-poll deadline.
    pub provider_poll_timeout: Duration,
    /// Providers to prefer initializing, but whose failure is tolerated.
    pub preferred_providers: Vec<ProviderId>,
    /// Providers whose initialization failure fails construction (§6).
    pub required_providers: Vec<ProviderId>,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        let measurement_interval = Duration::from_millis(1);
        MeasurementConfig {
            measurement_interval,
            buffer_capacity: crate::ring_buffer::DEFAULT_CAPACITY,
            auto_restart_unhealthy: true,
            restart_interval: Duration::from_secs(5),
            bracket_window: measurement_interval * 10,
            provider_poll_timeout: Duration::from_millis(100),
            preferred_providers: Vec::new(),
            required_providers: Vec::new(),
        }
    }
}

impl MeasurementConfig {
    /// Validates the configuration per §4.4's enumerated legal ranges.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.measurement_interval < MIN_MEASUREMENT_INTERVAL
            || self.measurement_interval > MAX_MEASUREMENT_INTERVAL
        {
            return Err(CoordinatorError::InvalidConfig(format!(
                "measurement_interval {:?} outside legal range [{:?}, {:?}]",
                self.measurement_interval, MIN_MEASUREMENT_INTERVAL, MAX_MEASUREMENT_INTERVAL
            )));
        }
        if self.buffer_capacity == 0 || !self.buffer_capacity.is_power_of_two() {
            return Err(CoordinatorError::InvalidConfig(format!(
                "buffer_capacity {} must be a nonzero power of two",
                self.buffer_capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MeasurementConfig::default().validate().is_ok());
    }

    #[test]
    fn bracket_window_defaults_to_ten_times_interval() {
        let config = MeasurementConfig::default();
        assert_eq!(config.bracket_window, config.measurement_interval * 10);
    }

    #[test]
    fn interval_outside_range_fails_validation() {
        let mut config = MeasurementConfig::default();
        config.measurement_interval = Duration::from_millis(200);
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_power_of_two_capacity_fails_validation() {
        let mut config = MeasurementConfig::default();
        config.buffer_capacity = 100;
        assert!(config.validate().is_err());
    }
}
