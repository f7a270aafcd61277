//! Alpaca camera binding.
//!
//! A capture is `startexposure`, then `imageready` polled at a fixed
//! interval, then `imagearray`. The image array arrives column-major
//! (`Value[x][y]`) and is transposed into a row-major raster.

use super::client::{bool_param, AlpacaClient, AlpacaDevice, AlpacaError, DeviceType};
use async_trait::async_trait;
use ndarray::Array2;
use shared::camera_interface::{
    CameraConfig, CameraError, CameraInterface, CameraResult, ExposureRequest, FrameMetadata,
    PixelFrame, Timestamp,
};
use shared::device_lock::DeviceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default interval between `imageready` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default allowance for readout and download on top of the exposure time.
pub const DEFAULT_READOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// ASCOM `CameraStates.cameraError`.
const CAMERA_STATE_ERROR: i32 = 5;

/// Optics in front of the sensor; the driver knows only the sensor itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct Optics {
    pub focal_length_mm: Option<f64>,
}

fn camera_error(err: AlpacaError) -> CameraError {
    if err.is_transport() || err.is_not_connected() {
        CameraError::DeviceNotReady(err.to_string())
    } else {
        CameraError::CaptureFailed(err.to_string())
    }
}

/// Bit depth implied by the driver's maximum ADU.
fn bit_depth_for_max_adu(max_adu: u32) -> u8 {
    let bits = 32 - max_adu.leading_zeros();
    bits.clamp(8, 16) as u8
}

/// Transpose an Alpaca image array (`[x][y]`) into a `(height, width)` raster.
///
/// Values outside the u16 range are clamped.
pub fn decode_image_array(columns: &[Vec<i64>]) -> Result<Array2<u16>, String> {
    let width = columns.len();
    let height = columns.first().map_or(0, |c| c.len());
    if width == 0 || height == 0 {
        return Err("image array is empty".to_string());
    }
    if let Some((x, column)) = columns.iter().enumerate().find(|(_, c)| c.len() != height) {
        return Err(format!(
            "ragged image array: column {x} has {} rows, expected {height}",
            column.len()
        ));
    }

    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        columns[x][y].clamp(0, u16::MAX as i64) as u16
    }))
}

/// Camera driven through an Alpaca `camera` device.
pub struct AlpacaCamera {
    device: AlpacaDevice,
    name: String,
    config: CameraConfig,
    lock: DeviceLock,
    frame_number: AtomicU64,
    poll_interval: Duration,
    readout_timeout: Duration,
}

impl AlpacaCamera {
    /// Connect to camera `device_number` and read the sensor geometry.
    pub async fn connect(
        client: &AlpacaClient,
        device_number: u32,
        optics: Optics,
    ) -> Result<Self, AlpacaError> {
        let device = client.device(DeviceType::Camera, device_number);
        device.set_connected(true).await?;

        let name = device
            .name()
            .await
            .unwrap_or_else(|_| format!("Alpaca camera {device_number}"));
        let width: u32 = device.get("cameraxsize").await?;
        let height: u32 = device.get("cameraysize").await?;
        let pixel_size_um = device.get::<f64>("pixelsizex").await.ok();
        let bit_depth = match device.get::<u32>("maxadu").await {
            Ok(max_adu) => bit_depth_for_max_adu(max_adu),
            Err(e) => {
                warn!("{name}: cannot read maxadu ({e}), assuming 16-bit");
                16
            }
        };

        let config = CameraConfig {
            width: width as usize,
            height: height as usize,
            bit_depth,
            pixel_size_um,
            focal_length_mm: optics.focal_length_mm,
        };

        info!(
            "Connected to camera '{}' ({}x{}, {}-bit) at {}",
            name,
            width,
            height,
            bit_depth,
            client.base_url()
        );

        Ok(Self {
            device,
            name,
            config,
            lock: DeviceLock::new(format!("camera {device_number}")),
            frame_number: AtomicU64::new(0),
            poll_interval: DEFAULT_POLL_INTERVAL,
            readout_timeout: DEFAULT_READOUT_TIMEOUT,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_readout_timeout(mut self, readout_timeout: Duration) -> Self {
        self.readout_timeout = readout_timeout;
        self
    }

    pub async fn disconnect(&self) -> Result<(), AlpacaError> {
        let _guard = self.lock.acquire().await;
        self.device.set_connected(false).await?;
        info!("Disconnected from camera '{}'", self.name);
        Ok(())
    }

    async fn wait_for_image(&self, exposure: Duration) -> CameraResult<()> {
        let deadline = exposure + self.readout_timeout;
        let start = Instant::now();

        loop {
            let ready: bool = self.device.get("imageready").await.map_err(camera_error)?;
            if ready {
                return Ok(());
            }

            if let Ok(CAMERA_STATE_ERROR) = self.device.get::<i32>("camerastate").await {
                return Err(CameraError::CaptureFailed(format!(
                    "{} reported camera error state",
                    self.name
                )));
            }

            if start.elapsed() >= deadline {
                if let Err(e) = self.device.put("abortexposure", &[]).await {
                    debug!("{}: abortexposure after timeout failed: {e}", self.name);
                }
                return Err(CameraError::CaptureTimeout(deadline));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl CameraInterface for AlpacaCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &CameraConfig {
        &self.config
    }

    async fn is_ready(&self) -> CameraResult<bool> {
        match self.device.is_connected().await {
            Ok(connected) => Ok(connected),
            Err(e) if e.is_transport() => Ok(false),
            Err(e) => Err(camera_error(e)),
        }
    }

    async fn capture(&self, request: &ExposureRequest) -> CameraResult<PixelFrame> {
        let _guard = self.lock.acquire().await;

        if !self.device.is_connected().await.map_err(camera_error)? {
            return Err(CameraError::DeviceNotReady(format!(
                "{} is not connected",
                self.name
            )));
        }

        if let Some(gain) = request.gain() {
            self.device
                .put("gain", &[("Gain", (gain.round() as i32).to_string())])
                .await
                .map_err(|e| match camera_error(e) {
                    CameraError::CaptureFailed(msg) => {
                        CameraError::Config(format!("gain {gain} rejected: {msg}"))
                    }
                    other => other,
                })?;
        }

        let exposure = request.exposure();
        let timestamp = Timestamp::now();
        debug!(
            "{}: starting {:.3}s exposure",
            self.name,
            exposure.as_secs_f64()
        );
        self.device
            .put(
                "startexposure",
                &[
                    ("Duration", exposure.as_secs_f64().to_string()),
                    ("Light", bool_param(true)),
                ],
            )
            .await
            .map_err(camera_error)?;

        tokio::time::sleep(exposure).await;
        self.wait_for_image(exposure).await?;

        let columns: Vec<Vec<i64>> = self.device.get("imagearray").await.map_err(camera_error)?;
        let data = decode_image_array(&columns).map_err(CameraError::CaptureFailed)?;

        let frame_number = self.frame_number.fetch_add(1, Ordering::SeqCst) + 1;
        let mut metadata = FrameMetadata::new(frame_number, exposure, timestamp);
        metadata.gain = request.gain();
        if let Ok(temperature) = self.device.get::<f64>("ccdtemperature").await {
            metadata.temperatures.insert("sensor".to_string(), temperature);
        }

        info!(
            "{}: frame {} captured ({}x{})",
            self.name,
            frame_number,
            data.ncols(),
            data.nrows()
        );

        let mut frame = PixelFrame::new(data, self.config.bit_depth, metadata);
        if let Some(scale) = self.config.pixel_scale() {
            frame = frame.with_pixel_scale(scale);
        }
        Ok(frame)
    }

    async fn abort_exposure(&self) -> CameraResult<()> {
        self.device
            .put("abortexposure", &[])
            .await
            .map_err(camera_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alpaca::client::DEFAULT_REQUEST_TIMEOUT;
    use mockito::{Matcher, Mock, Server, ServerGuard};

    const EMPTY_OK: &str = r#"{"ErrorNumber":0,"ErrorMessage":""}"#;

    async fn mock_get(server: &mut ServerGuard, method: &str, value: &str) -> Mock {
        server
            .mock("GET", format!("/api/v1/camera/0/{method}").as_str())
            .match_query(Matcher::Any)
            .with_body(format!(
                r#"{{"Value":{value},"ErrorNumber":0,"ErrorMessage":""}}"#
            ))
            .create_async()
            .await
    }

    async fn mock_put(server: &mut ServerGuard, method: &str) -> Mock {
        server
            .mock("PUT", format!("/api/v1/camera/0/{method}").as_str())
            .with_body(EMPTY_OK)
            .create_async()
            .await
    }

    async fn connected_camera(server: &mut ServerGuard) -> AlpacaCamera {
        mock_put(server, "connected").await;
        mock_get(server, "connected", "true").await;
        mock_get(server, "name", r#""Test Camera""#).await;
        mock_get(server, "cameraxsize", "3").await;
        mock_get(server, "cameraysize", "2").await;
        mock_get(server, "pixelsizex", "3.76").await;
        mock_get(server, "maxadu", "4095").await;
        let client = AlpacaClient::new(&server.url(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        AlpacaCamera::connect(
            &client,
            0,
            Optics {
                focal_length_mm: Some(400.0),
            },
        )
        .await
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
        .with_readout_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_decode_image_array_transposes() {
        let columns = vec![vec![1, 4], vec![2, 5], vec![3, 70_000]];
        let data = decode_image_array(&columns).unwrap();
        assert_eq!(data.dim(), (2, 3));
        assert_eq!(data[[0, 0]], 1);
        assert_eq!(data[[0, 2]], 3);
        assert_eq!(data[[1, 0]], 4);
        assert_eq!(data[[1, 2]], u16::MAX);
    }

    #[test]
    fn test_decode_rejects_empty_and_ragged() {
        assert!(decode_image_array(&[]).is_err());
        assert!(decode_image_array(&[vec![1, 2], vec![3]]).is_err());
    }

    #[test]
    fn test_bit_depth_for_max_adu() {
        assert_eq!(bit_depth_for_max_adu(4095), 12);
        assert_eq!(bit_depth_for_max_adu(65535), 16);
        assert_eq!(bit_depth_for_max_adu(255), 8);
        assert_eq!(bit_depth_for_max_adu(15), 8);
    }

    #[tokio::test]
    async fn test_connect_reads_geometry() {
        let mut server = Server::new_async().await;
        let camera = connected_camera(&mut server).await;
        assert_eq!(camera.name(), "Test Camera");
        assert_eq!(camera.config().width, 3);
        assert_eq!(camera.config().height, 2);
        assert_eq!(camera.config().bit_depth, 12);
        assert!(camera.config().pixel_scale().is_some());
        assert!(camera.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_capture_sets_gain_and_decodes_frame() {
        let mut server = Server::new_async().await;
        let camera = connected_camera(&mut server).await;

        let gain = server
            .mock("PUT", "/api/v1/camera/0/gain")
            .match_body(Matcher::UrlEncoded("Gain".into(), "120".into()))
            .with_body(EMPTY_OK)
            .create_async()
            .await;
        let start = server
            .mock("PUT", "/api/v1/camera/0/startexposure")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("Duration".into(), "0.01".into()),
                Matcher::UrlEncoded("Light".into(), "True".into()),
            ]))
            .with_body(EMPTY_OK)
            .create_async()
            .await;
        mock_get(&mut server, "imageready", "true").await;
        mock_get(&mut server, "imagearray", "[[10,40],[20,50],[30,60]]").await;
        mock_get(&mut server, "ccdtemperature", "-5.0").await;

        let request = ExposureRequest::new(0.01, Some(120.0)).unwrap();
        let frame = camera.capture(&request).await.unwrap();
        gain.assert_async().await;
        start.assert_async().await;

        assert_eq!(frame.width(), 3);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.data()[[1, 1]], 50);
        assert_eq!(frame.bit_depth(), 12);
        assert_eq!(frame.metadata().frame_number, 1);
        assert_eq!(frame.metadata().temperatures.get("sensor"), Some(&-5.0));
        assert!(frame.pixel_scale().is_some());
    }

    #[tokio::test]
    async fn test_capture_times_out_when_image_never_ready() {
        let mut server = Server::new_async().await;
        let camera = connected_camera(&mut server).await;
        mock_put(&mut server, "startexposure").await;
        mock_put(&mut server, "abortexposure").await;
        mock_get(&mut server, "imageready", "false").await;
        mock_get(&mut server, "camerastate", "2").await;

        let request = ExposureRequest::new(0.01, None).unwrap();
        let result = camera.capture(&request).await;
        assert!(matches!(result, Err(CameraError::CaptureTimeout(_))));
    }

    #[tokio::test]
    async fn test_camera_error_state_fails_capture() {
        let mut server = Server::new_async().await;
        let camera = connected_camera(&mut server).await;
        mock_put(&mut server, "startexposure").await;
        mock_get(&mut server, "imageready", "false").await;
        mock_get(&mut server, "camerastate", "5").await;

        let request = ExposureRequest::new(0.01, None).unwrap();
        let result = camera.capture(&request).await;
        assert!(matches!(result, Err(CameraError::CaptureFailed(_))));
    }

    #[tokio::test]
    async fn test_rejected_gain_is_config_error() {
        let mut server = Server::new_async().await;
        let camera = connected_camera(&mut server).await;
        server
            .mock("PUT", "/api/v1/camera/0/gain")
            .with_body(r#"{"ErrorNumber":1025,"ErrorMessage":"Gain out of range"}"#)
            .create_async()
            .await;

        let request = ExposureRequest::new(0.01, Some(9999.0)).unwrap();
        let result = camera.capture(&request).await;
        assert!(matches!(result, Err(CameraError::Config(_))));
    }
}
