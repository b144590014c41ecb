//! Crate error taxonomy.
//!
//! Per-subsystem `thiserror` enums (`TimerError`, `ProviderError`,
//! `CoordinatorError`) aggregated into one top-level [`NembError`], the only
//! error type ever returned across the crate's public construction-time
//! API. Everything that happens after construction is degraded-but-defined:
//! recorded in diagnostics and reflected in per-reading `valid` /
//! per-checkpoint `confidence` instead of propagating as an error.

use std::time::Duration;
use thiserror::Error;

/// PrecisionTimer construction errors.
#[derive(Error, Debug)]
pub enum TimerError {
    #[error("no usable monotonic clock source is available on this platform")]
    NoUsableClock,
}

/// EnergyProvider construction and polling errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider {provider_id} failed to initialize: {reason}")]
    InitializationFailed { provider_id: String, reason: String },

    #[error("provider {provider_id} initialization exceeded timeout of {timeout:?}")]
    InitializationTimeout {
        provider_id: String,
        timeout: Duration,
    },

    #[error("provider {provider_id} is unhealthy after {consecutive_failures} consecutive invalid polls")]
    Unhealthy {
        provider_id: String,
        consecutive_failures: u32,
    },
}

/// MeasurementCoordinator construction and lifecycle errors.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("required provider {0} failed to initialize")]
    RequiredProviderUnavailable(String),

    #[error("no provider initialized successfully; at least one provider is required")]
    NoProvidersAvailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Top-level crate error.
#[derive(Error, Debug)]
pub enum NembError {
    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// Returned by any `Handle` method invoked after `shutdown()` has
    /// completed. Realizes the `ShutdownRace` taxonomy entry: never
    /// undefined behavior, always a clear, explicit rejection.
    #[error("operation invoked after shutdown")]
    AlreadyShutdown,
}

pub type Result<T> = std::result::Result<T, NembError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display() {
        let err = ProviderError::InitializationFailed {
            provider_id: "cpu.package.0".to_string(),
            reason: "msr device unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "provider cpu.package.0 failed to initialize: msr device unavailable"
        );
    }

    #[test]
    fn nemb_error_from_conversions() {
        let err: NembError = CoordinatorError::NoProvidersAvailable.into();
        assert!(matches!(err, NembError::Coordinator(_)));
    }

    #[test]
    fn already_shutdown_is_distinct_variant() {
        let err = NembError::AlreadyShutdown;
        assert_eq!(err.to_string(), "operation invoked after shutdown");
    }
}
