use super::{
    CameraConfig, CameraError, CameraInterface, CameraResult, ExposureRequest, FrameMetadata,
    PixelFrame, Timestamp,
};
use crate::device_lock::DeviceLock;
use crate::sky::SkyCoordinate;
use async_trait::async_trait;
use ndarray::Array2;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// In-memory camera returning a fixed raster.
///
/// Failures can be queued with [`MockCamera::push_failure`]; each queued
/// error is consumed by one capture, after which captures succeed again.
pub struct MockCamera {
    config: CameraConfig,
    lock: DeviceLock,
    frame: Array2<u16>,
    readout_delay: Duration,
    failures: Mutex<VecDeque<CameraError>>,
    frame_count: AtomicU64,
    connected: AtomicBool,
    pointing: Mutex<Option<SkyCoordinate>>,
    last_request: Mutex<Option<ExposureRequest>>,
    abort_count: AtomicU64,
    windows: Mutex<Vec<(Instant, Instant)>>,
}

impl MockCamera {
    pub fn new(config: CameraConfig, frame: Array2<u16>) -> Self {
        Self {
            config,
            lock: DeviceLock::new("MockCamera"),
            frame,
            readout_delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            frame_count: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            pointing: Mutex::new(None),
            last_request: Mutex::new(None),
            abort_count: AtomicU64::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn new_zeros(width: usize, height: usize) -> Self {
        let config = CameraConfig {
            width,
            height,
            bit_depth: 16,
            pixel_size_um: Some(3.76),
            focal_length_mm: Some(400.0),
        };
        Self::new(config, Array2::zeros((height, width)))
    }

    /// Time each capture takes (stands in for exposure plus readout).
    pub fn with_readout_delay(mut self, delay: Duration) -> Self {
        self.readout_delay = delay;
        self
    }

    /// Fail the next capture that has not already consumed a queued failure.
    pub fn push_failure(&self, error: CameraError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Approximate pointing reported in frame metadata.
    pub fn set_pointing(&self, pointing: Option<SkyCoordinate>) {
        *self.pointing.lock().unwrap() = pointing;
    }

    /// Number of capture calls that reached the device (including failures).
    pub fn capture_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ExposureRequest> {
        *self.last_request.lock().unwrap()
    }

    /// Number of `abort_exposure` calls.
    pub fn abort_count(&self) -> u64 {
        self.abort_count.load(Ordering::SeqCst)
    }

    /// Start and end of every capture that ran to completion, in order.
    pub fn capture_windows(&self) -> Vec<(Instant, Instant)> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl CameraInterface for MockCamera {
    fn name(&self) -> &str {
        "MockCamera"
    }

    fn config(&self) -> &CameraConfig {
        &self.config
    }

    async fn is_ready(&self) -> CameraResult<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn capture(&self, request: &ExposureRequest) -> CameraResult<PixelFrame> {
        let _guard = self.lock.acquire().await;

        if !self.connected.load(Ordering::SeqCst) {
            return Err(CameraError::DeviceNotReady("mock camera disconnected".to_string()));
        }

        *self.last_request.lock().unwrap() = Some(*request);
        let frame_number = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = Timestamp::now();
        let started = Instant::now();

        if !self.readout_delay.is_zero() {
            tokio::time::sleep(self.readout_delay).await;
        }
        self.windows.lock().unwrap().push((started, Instant::now()));

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut metadata = FrameMetadata::new(frame_number, request.exposure(), timestamp);
        metadata.gain = request.gain();
        metadata.pointing = *self.pointing.lock().unwrap();
        metadata.temperatures.insert("sensor".to_string(), 20.0);

        let mut frame = PixelFrame::new(self.frame.clone(), self.config.bit_depth, metadata);
        if let Some(scale) = self.config.pixel_scale() {
            frame = frame.with_pixel_scale(scale);
        }
        Ok(frame)
    }

    async fn abort_exposure(&self) -> CameraResult<()> {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
