//! Image acquisition abstraction.
//!
//! Provides a unified interface for taking a single exposure that can be
//! backed by a mock (for testing), a simulator, or real hardware. The
//! correction loop only ever asks for one frame at a time and waits for
//! exposure plus readout to complete.

pub mod mock;

use crate::sky::{PixelScale, SkyCoordinate};
use async_trait::async_trait;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Wall-clock timestamp as seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds component
    pub seconds: u64,
    /// Nanoseconds component (0-999,999,999)
    pub nanos: u64,
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(seconds: u64, nanos: u64) -> Self {
        Self { seconds, nanos }
    }

    /// Current system time
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_duration(since_epoch)
    }

    /// Create a timestamp from a Duration since epoch
    pub fn from_duration(duration: Duration) -> Self {
        let total_nanos = duration.as_nanos();
        let seconds = (total_nanos / 1_000_000_000) as u64;
        let nanos = (total_nanos % 1_000_000_000) as u64;
        Self { seconds, nanos }
    }

    /// Convert to Duration
    pub fn to_duration(&self) -> Duration {
        Duration::new(self.seconds, self.nanos as u32)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// Error type for camera operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Device is not connected or reports it cannot start an exposure
    #[error("camera not ready: {0}")]
    DeviceNotReady(String),

    /// Exposure plus readout did not finish within the allowed time
    #[error("capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    /// Sensor or driver reported a failure during capture
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    /// Exposure time must be positive and finite
    #[error("invalid exposure time: {0} s")]
    InvalidExposure(f64),

    /// Camera rejected a configuration value
    #[error("configuration error: {0}")]
    Config(String),
}

impl CameraError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CameraError::DeviceNotReady(_)
                | CameraError::CaptureTimeout(_)
                | CameraError::CaptureFailed(_)
        )
    }
}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Parameters of a single exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureRequest {
    exposure: Duration,
    gain: Option<f64>,
}

impl ExposureRequest {
    /// Validate and build an exposure request.
    ///
    /// Fails with [`CameraError::InvalidExposure`] unless `exposure_secs` is
    /// positive, finite and representable as a `Duration`.
    pub fn new(exposure_secs: f64, gain: Option<f64>) -> CameraResult<Self> {
        if exposure_secs <= 0.0 {
            return Err(CameraError::InvalidExposure(exposure_secs));
        }
        let exposure = Duration::try_from_secs_f64(exposure_secs)
            .map_err(|_| CameraError::InvalidExposure(exposure_secs))?;
        Ok(Self { exposure, gain })
    }

    pub fn exposure(&self) -> Duration {
        self.exposure
    }

    pub fn gain(&self) -> Option<f64> {
        self.gain
    }
}

/// Camera metadata returned with each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Frame sequence number
    pub frame_number: u64,
    /// Exposure duration
    pub exposure: Duration,
    /// Gain applied for this frame, if the camera supports it
    pub gain: Option<f64>,
    /// Timestamp when the exposure started
    pub timestamp: Timestamp,
    /// Approximate telescope pointing at capture time, if known
    pub pointing: Option<SkyCoordinate>,
    /// Temperature readings keyed by sensor location, in Celsius
    pub temperatures: HashMap<String, f64>,
}

impl FrameMetadata {
    pub fn new(frame_number: u64, exposure: Duration, timestamp: Timestamp) -> Self {
        Self {
            frame_number,
            exposure,
            gain: None,
            timestamp,
            pointing: None,
            temperatures: HashMap::new(),
        }
    }
}

/// A captured raster and everything known about how it was taken.
///
/// Frames are never mutated after capture; observers share them behind an
/// `Arc` and the solver borrows them.
#[derive(Debug, Clone)]
pub struct PixelFrame {
    data: Array2<u16>,
    bit_depth: u8,
    metadata: FrameMetadata,
    pixel_scale: Option<PixelScale>,
}

impl PixelFrame {
    pub fn new(data: Array2<u16>, bit_depth: u8, metadata: FrameMetadata) -> Self {
        Self {
            data,
            bit_depth,
            metadata,
            pixel_scale: None,
        }
    }

    /// Attach the nominal plate scale used for field-of-view estimates.
    pub fn with_pixel_scale(mut self, pixel_scale: PixelScale) -> Self {
        self.pixel_scale = Some(pixel_scale);
        self
    }

    pub fn data(&self) -> ArrayView2<'_, u16> {
        self.data.view()
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn timestamp(&self) -> Timestamp {
        self.metadata.timestamp
    }

    pub fn pixel_scale(&self) -> Option<PixelScale> {
        self.pixel_scale
    }

    /// Nominal (width, height) field of view in degrees, if the plate scale is known.
    pub fn field_of_view_deg(&self) -> Option<(f64, f64)> {
        self.pixel_scale.map(|scale| {
            (
                scale.field_of_view_deg(self.width()),
                scale.field_of_view_deg(self.height()),
            )
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Static description of a camera and its optics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Sensor width in pixels
    pub width: usize,
    /// Sensor height in pixels
    pub height: usize,
    /// ADC bit depth (8, 12, 14, 16 bits typical)
    pub bit_depth: u8,
    /// Pixel pitch in micrometers
    pub pixel_size_um: Option<f64>,
    /// Focal length of the imaging train in millimeters
    pub focal_length_mm: Option<f64>,
}

impl CameraConfig {
    /// Maximum ADC value for the configured bit depth.
    pub fn get_saturation(&self) -> f64 {
        (2_u64.pow(self.bit_depth as u32) - 1) as f64
    }

    /// Nominal plate scale, when both pixel pitch and focal length are known.
    pub fn pixel_scale(&self) -> Option<PixelScale> {
        match (self.pixel_size_um, self.focal_length_mm) {
            (Some(px), Some(fl)) if px > 0.0 && fl > 0.0 => Some(PixelScale::from_optics(px, fl)),
            _ => None,
        }
    }
}

/// Trait for unified camera interface
///
/// Implementations own their hardware exclusively: concurrent `capture`
/// calls on the same instance must be serialized internally, so at most one
/// exposure is ever outstanding.
#[async_trait]
pub trait CameraInterface: Send + Sync {
    /// Get camera name/identifier
    fn name(&self) -> &str;

    /// Get camera configuration
    fn config(&self) -> &CameraConfig;

    /// Check if camera is connected and able to start an exposure
    async fn is_ready(&self) -> CameraResult<bool>;

    /// Take one exposure and return the decoded frame.
    ///
    /// Resolves once exposure and readout have finished.
    ///
    /// # Errors
    /// * `DeviceNotReady` if the device reports it is not connected
    /// * `CaptureTimeout` if readout exceeds the adapter's bound
    /// * `CaptureFailed` for sensor-reported errors
    async fn capture(&self, request: &ExposureRequest) -> CameraResult<PixelFrame>;

    /// Abandon an exposure in progress, if the hardware supports it.
    async fn abort_exposure(&self) -> CameraResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_duration() {
        let ts = Timestamp::from_duration(Duration::new(10, 123_456_789));
        assert_eq!(ts.seconds, 10);
        assert_eq!(ts.nanos, 123_456_789);

        let ts = Timestamp::from_duration(Duration::from_millis(1500));
        assert_eq!(ts.seconds, 1);
        assert_eq!(ts.nanos, 500_000_000);
        assert_eq!(ts.to_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::new(42, 123_456_789).to_string(), "42.123456789");
        assert_eq!(Timestamp::new(0, 1).to_string(), "0.000000001");
    }

    #[test]
    fn test_exposure_request_validation() {
        assert!(ExposureRequest::new(2.0, Some(50.0)).is_ok());
        assert_eq!(
            ExposureRequest::new(0.0, None),
            Err(CameraError::InvalidExposure(0.0))
        );
        assert!(ExposureRequest::new(-1.0, None).is_err());
        assert!(ExposureRequest::new(f64::NAN, None).is_err());
        assert_eq!(
            ExposureRequest::new(1e20, None),
            Err(CameraError::InvalidExposure(1e20))
        );

        let request = ExposureRequest::new(0.25, None).unwrap();
        assert_eq!(request.exposure(), Duration::from_millis(250));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CameraError::DeviceNotReady("off".into()).is_retryable());
        assert!(CameraError::CaptureTimeout(Duration::from_secs(1)).is_retryable());
        assert!(CameraError::CaptureFailed("sensor".into()).is_retryable());
        assert!(!CameraError::InvalidExposure(0.0).is_retryable());
        assert!(!CameraError::Config("gain".into()).is_retryable());
    }

    #[test]
    fn test_frame_field_of_view() {
        let metadata = FrameMetadata::new(1, Duration::from_secs(1), Timestamp::new(0, 0));
        let frame = PixelFrame::new(Array2::zeros((200, 300)), 16, metadata)
            .with_pixel_scale(PixelScale::from_arcsec_per_pixel(36.0));

        assert_eq!(frame.width(), 300);
        assert_eq!(frame.height(), 200);
        let (w, h) = frame.field_of_view_deg().unwrap();
        assert!((w - 3.0).abs() < 1e-12);
        assert!((h - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_camera_config_saturation_and_scale() {
        let config = CameraConfig {
            width: 640,
            height: 480,
            bit_depth: 12,
            pixel_size_um: Some(3.76),
            focal_length_mm: None,
        };
        assert_eq!(config.get_saturation(), 4095.0);
        assert!(config.pixel_scale().is_none());

        let config = CameraConfig {
            focal_length_mm: Some(400.0),
            ..config
        };
        assert!(config.pixel_scale().is_some());
    }
}
