use crate::error::ConfigurationError;
use clap::Args;
use serde::{Deserialize, Serialize};
use shared::camera_interface::ExposureRequest;
use shared::sky::SkyCoordinate;
use std::time::Duration;

/// Tuning of the correction loop that is independent of the target.
///
/// Durations are carried as seconds so the same struct serves as command
/// line arguments and as a stored profile.
#[derive(Args, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Bound on one exposure including readout
    #[arg(long, default_value_t = 120.0, help = "Capture timeout in seconds")]
    pub capture_timeout_secs: f64,

    /// Bound on one plate solve
    #[arg(long, default_value_t = 180.0, help = "Plate solve timeout in seconds")]
    pub solve_timeout_secs: f64,

    /// Bound on waiting for a correcting slew to settle
    #[arg(long, default_value_t = 120.0, help = "Slew settle timeout in seconds")]
    pub motion_timeout_secs: f64,

    /// Pause before retrying after a failed capture, solve or mount command
    #[arg(long, default_value_t = 2.0, help = "Delay before a retry in seconds")]
    pub retry_backoff_secs: f64,

    /// Initial radius of a hinted solve
    #[arg(long, default_value_t = 5.0, help = "Initial hinted search radius in degrees")]
    pub search_radius_deg: f64,

    /// Factor applied to the search radius after each failed solve
    #[arg(long, default_value_t = 2.0, help = "Search radius growth after a failed solve")]
    pub radius_growth: f64,

    /// Upper bound on the widened search radius
    #[arg(long, default_value_t = 30.0, help = "Maximum hinted search radius in degrees")]
    pub max_search_radius_deg: f64,

    /// Pass the mount position as a hint on the very first solve
    #[arg(
        long,
        help = "Hint the first solve with the mount's reported position",
        long_help = "By default the first solve is blind so a badly aligned mount cannot \
            restrict the search to the wrong area. Set this when the mount model is \
            known to be close."
    )]
    pub hint_first_attempt: bool,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            capture_timeout_secs: 120.0,
            solve_timeout_secs: 180.0,
            motion_timeout_secs: 120.0,
            retry_backoff_secs: 2.0,
            search_radius_deg: 5.0,
            radius_growth: 2.0,
            max_search_radius_deg: 30.0,
            hint_first_attempt: false,
        }
    }
}

fn positive_duration(name: &'static str, value: f64) -> Result<Duration, ConfigurationError> {
    if value <= 0.0 {
        return Err(ConfigurationError::InvalidDuration { name, value });
    }
    non_negative_duration(name, value)
}

/// Rejects NaN, negative and values too large for a `Duration`.
fn non_negative_duration(name: &'static str, value: f64) -> Result<Duration, ConfigurationError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigurationError::InvalidDuration { name, value })
}

/// Saturating conversion for the accessors; `validate` rejects what this clamps.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl CorrectionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        positive_duration("capture_timeout", self.capture_timeout_secs)?;
        positive_duration("solve_timeout", self.solve_timeout_secs)?;
        positive_duration("motion_timeout", self.motion_timeout_secs)?;
        non_negative_duration("retry_backoff", self.retry_backoff_secs)?;

        if !self.search_radius_deg.is_finite() || self.search_radius_deg <= 0.0 {
            return Err(ConfigurationError::InvalidSearchRadius(format!(
                "initial radius {}° must be positive",
                self.search_radius_deg
            )));
        }
        if !self.radius_growth.is_finite() || self.radius_growth < 1.0 {
            return Err(ConfigurationError::InvalidSearchRadius(format!(
                "growth factor {} must be at least 1",
                self.radius_growth
            )));
        }
        if !self.max_search_radius_deg.is_finite()
            || self.max_search_radius_deg < self.search_radius_deg
            || self.max_search_radius_deg > 180.0
        {
            return Err(ConfigurationError::InvalidSearchRadius(format!(
                "maximum radius {}° must lie between {}° and 180°",
                self.max_search_radius_deg, self.search_radius_deg
            )));
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        seconds(self.capture_timeout_secs)
    }

    pub fn solve_timeout(&self) -> Duration {
        seconds(self.solve_timeout_secs)
    }

    pub fn motion_timeout(&self) -> Duration {
        seconds(self.motion_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        seconds(self.retry_backoff_secs)
    }

    /// Search radius to use after one more failed solve.
    pub fn widen_radius(&self, radius_deg: f64) -> f64 {
        (radius_deg * self.radius_growth).min(self.max_search_radius_deg)
    }
}

/// One pointing-correction run: where to point and when to stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Intended pointing
    pub target: SkyCoordinate,
    /// Hard ceiling on capture/solve/correct iterations
    pub max_attempts: u32,
    /// Pointing error at or below which the run has converged, degrees
    pub tolerance_deg: f64,
    /// Exposure per attempt, seconds
    pub exposure_secs: f64,
    /// Camera gain, when the camera supports it
    pub gain: Option<f64>,
}

impl RunRequest {
    /// Request with five attempts, a 0.01° tolerance and 5 s exposures.
    pub fn new(target: SkyCoordinate) -> Self {
        Self {
            target,
            max_attempts: 5,
            tolerance_deg: 0.01,
            exposure_secs: 5.0,
            gain: None,
        }
    }

    /// Build a request from raw degrees, rejecting impossible targets.
    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Result<Self, ConfigurationError> {
        Ok(Self::new(SkyCoordinate::new(ra_deg, dec_deg)?))
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tolerance_deg(mut self, tolerance_deg: f64) -> Self {
        self.tolerance_deg = tolerance_deg;
        self
    }

    pub fn with_exposure_secs(mut self, exposure_secs: f64) -> Self {
        self.exposure_secs = exposure_secs;
        self
    }

    pub fn with_gain(mut self, gain: Option<f64>) -> Self {
        self.gain = gain;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::ZeroAttempts);
        }
        if !self.tolerance_deg.is_finite() || self.tolerance_deg <= 0.0 {
            return Err(ConfigurationError::InvalidTolerance(self.tolerance_deg));
        }
        if let Some(gain) = self.gain {
            if !gain.is_finite() || gain < 0.0 {
                return Err(ConfigurationError::InvalidGain(gain));
            }
        }
        self.exposure_request()?;
        Ok(())
    }

    /// Exposure parameters for every capture of this run.
    pub fn exposure_request(&self) -> Result<ExposureRequest, ConfigurationError> {
        ExposureRequest::new(self.exposure_secs, self.gain)
            .map_err(|_| ConfigurationError::InvalidExposure(self.exposure_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::sky::CoordinateError;

    #[test]
    fn test_default_config_is_valid() {
        let config = CorrectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_backoff(), Duration::from_secs(2));
        assert!(!config.hint_first_attempt);
    }

    #[test]
    fn test_invalid_durations_rejected() {
        let config = CorrectionConfig {
            solve_timeout_secs: 0.0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidDuration {
                name: "solve_timeout",
                value: 0.0
            })
        );

        let config = CorrectionConfig {
            retry_backoff_secs: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CorrectionConfig {
            retry_backoff_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let config = CorrectionConfig {
            capture_timeout_secs: 1e20,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidDuration {
                name: "capture_timeout",
                value: 1e20
            })
        );
        assert_eq!(config.capture_timeout(), Duration::MAX);

        let config = CorrectionConfig {
            retry_backoff_secs: f64::INFINITY,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidDuration {
                name: "retry_backoff",
                ..
            })
        ));

        let request = RunRequest::from_degrees(10.0, 20.0)
            .unwrap()
            .with_exposure_secs(1e20);
        assert_eq!(
            request.validate(),
            Err(ConfigurationError::InvalidExposure(1e20))
        );
    }

    #[test]
    fn test_radius_settings_rejected() {
        let shrinking = CorrectionConfig {
            radius_growth: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            shrinking.validate(),
            Err(ConfigurationError::InvalidSearchRadius(_))
        ));

        let cap_below_start = CorrectionConfig {
            search_radius_deg: 10.0,
            max_search_radius_deg: 5.0,
            ..Default::default()
        };
        assert!(cap_below_start.validate().is_err());
    }

    #[test]
    fn test_widen_radius_is_capped() {
        let config = CorrectionConfig::default();
        assert_eq!(config.widen_radius(5.0), 10.0);
        assert_eq!(config.widen_radius(20.0), 30.0);
        assert_eq!(config.widen_radius(30.0), 30.0);
    }

    #[test]
    fn test_request_validation() {
        let request = RunRequest::from_degrees(10.0, 20.0).unwrap();
        assert!(request.validate().is_ok());

        assert_eq!(
            request.clone().with_max_attempts(0).validate(),
            Err(ConfigurationError::ZeroAttempts)
        );
        assert_eq!(
            request.clone().with_tolerance_deg(0.0).validate(),
            Err(ConfigurationError::InvalidTolerance(0.0))
        );
        assert_eq!(
            request.clone().with_exposure_secs(-2.0).validate(),
            Err(ConfigurationError::InvalidExposure(-2.0))
        );
        assert!(matches!(
            request.with_gain(Some(f64::NAN)).validate(),
            Err(ConfigurationError::InvalidGain(_))
        ));
    }

    #[test]
    fn test_invalid_target_rejected() {
        let err = RunRequest::from_degrees(10.0, 95.0).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InvalidTarget(CoordinateError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn test_config_round_trips_through_partial_json() {
        let config: CorrectionConfig =
            serde_json::from_str(r#"{"retry_backoff_secs": 0.5, "hint_first_attempt": true}"#)
                .unwrap();
        assert_eq!(config.retry_backoff_secs, 0.5);
        assert!(config.hint_first_attempt);
        assert_eq!(config.search_radius_deg, 5.0);
    }
}
