use shared::sky::CoordinateError;
use thiserror::Error;

/// Problems with a run request or correction settings.
///
/// These are detected before any device is touched and are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Target coordinate could not be built or parsed.
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] CoordinateError),

    /// Exposure time must be positive and finite.
    #[error("exposure must be positive, got {0} s")]
    InvalidExposure(f64),

    /// Gain must be finite and non-negative.
    #[error("gain must be non-negative, got {0}")]
    InvalidGain(f64),

    /// At least one attempt is required.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    /// Convergence tolerance must be positive and finite.
    #[error("tolerance must be positive, got {0}°")]
    InvalidTolerance(f64),

    /// A timeout or backoff setting is negative, zero where not allowed, or not finite.
    #[error("invalid {name}: {value} s")]
    InvalidDuration {
        /// Setting name.
        name: &'static str,
        /// Offending value in seconds.
        value: f64,
    },

    /// Search radius settings are inconsistent.
    #[error("invalid search radius: {0}")]
    InvalidSearchRadius(String),
}
