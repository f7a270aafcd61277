//! Simulated observatory.
//!
//! A mount with a deliberately wrong pointing model, a camera that renders a
//! synthetic star field and stamps each frame with where the telescope truly
//! points, and a solver that reads that truth back with some noise. Together
//! they let the whole correction loop run without hardware.

use async_trait::async_trait;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::camera_interface::{
    CameraConfig, CameraError, CameraInterface, CameraResult, ExposureRequest, FrameMetadata,
    PixelFrame, Timestamp,
};
use shared::device_lock::DeviceLock;
use shared::mount_interface::{
    poll_until_settled, MotionStatus, MountError, MountInterface, MountResult, MountState,
    SharedMountState,
};
use shared::plate_solver::{check_frame, PlateSolver, SolveFailure, SolveHint, SolveResult, Solution};
use shared::sky::{apply_offset, PixelScale, SkyCoordinate, ARCSEC_PER_DEG};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Uniform sample in [-scale, scale].
fn jitter(rng: &mut StdRng, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    rng.gen_range(-1.0_f64..=1.0) * scale
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the mount thinks it points versus where it really points.
#[derive(Debug, Clone, Copy)]
struct MechanicalModel {
    believed: SkyCoordinate,
    actual: SkyCoordinate,
    slew_started: Option<Instant>,
    slew_duration: Duration,
}

impl MechanicalModel {
    /// Per-axis error of the pointing model (believed - actual), degrees.
    fn model_error(&self) -> (f64, f64) {
        self.actual.offset_to(&self.believed)
    }
}

/// Mount whose pointing model is off by a fixed offset until it is synced.
///
/// Each slew lands at the commanded position minus the model error, plus a
/// uniform scatter. Slew time is proportional to the distance moved.
pub struct SimulatedMount {
    lock: DeviceLock,
    state: SharedMountState,
    model: Mutex<MechanicalModel>,
    rng: Mutex<StdRng>,
    slew_rate_deg_per_sec: f64,
    slew_scatter_deg: f64,
    poll_interval: Duration,
}

impl SimulatedMount {
    /// Mount truly pointing at `actual` while believing it is displaced by
    /// (`model_error_ra_deg`, `model_error_dec_deg`).
    pub fn new(actual: SkyCoordinate, model_error_ra_deg: f64, model_error_dec_deg: f64) -> Self {
        let believed = apply_offset(&actual, model_error_ra_deg, model_error_dec_deg);
        Self {
            lock: DeviceLock::new("simulated mount"),
            state: SharedMountState::new(),
            model: Mutex::new(MechanicalModel {
                believed,
                actual,
                slew_started: None,
                slew_duration: Duration::ZERO,
            }),
            rng: Mutex::new(StdRng::seed_from_u64(0x5eed)),
            slew_rate_deg_per_sec: 4.0,
            slew_scatter_deg: 3.0 / ARCSEC_PER_DEG,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *lock(&self.rng) = StdRng::seed_from_u64(seed);
        self
    }

    /// Degrees per second; zero or less means slews complete instantly.
    pub fn with_slew_rate(mut self, deg_per_sec: f64) -> Self {
        self.slew_rate_deg_per_sec = deg_per_sec;
        self
    }

    /// Maximum per-axis landing error of a slew, arcseconds.
    pub fn with_slew_scatter_arcsec(mut self, arcsec: f64) -> Self {
        self.slew_scatter_deg = arcsec / ARCSEC_PER_DEG;
        self
    }

    /// Where the telescope really points.
    pub fn true_pointing(&self) -> SkyCoordinate {
        lock(&self.model).actual
    }

    fn poll_status(&self) -> MotionStatus {
        let status = self.state.snapshot().status;
        if status != MotionStatus::Slewing {
            return status;
        }
        let model = *lock(&self.model);
        let done = model
            .slew_started
            .map_or(true, |start| start.elapsed() >= model.slew_duration);
        if done {
            self.state.set_status(MotionStatus::Tracking);
            MotionStatus::Tracking
        } else {
            MotionStatus::Slewing
        }
    }
}

#[async_trait]
impl MountInterface for SimulatedMount {
    fn name(&self) -> &str {
        "SimulatedMount"
    }

    async fn current_position(&self) -> MountResult<SkyCoordinate> {
        let _guard = self.lock.acquire().await;
        Ok(lock(&self.model).believed)
    }

    async fn slew_to(&self, target: SkyCoordinate) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        if self.state.snapshot().status == MotionStatus::Fault {
            return Err(MountError::CommandRejected("mount is faulted".to_string()));
        }

        let (scatter_ra, scatter_dec) = {
            let mut rng = lock(&self.rng);
            (
                jitter(&mut rng, self.slew_scatter_deg),
                jitter(&mut rng, self.slew_scatter_deg),
            )
        };

        let mut model = lock(&self.model);
        let (error_ra, error_dec) = model.model_error();
        let landing = apply_offset(&target, -error_ra, -error_dec);
        let landing = apply_offset(&landing, scatter_ra, scatter_dec);
        let distance = model.actual.separation(&landing);

        model.slew_duration = if self.slew_rate_deg_per_sec > 0.0 {
            Duration::from_secs_f64(distance / self.slew_rate_deg_per_sec)
        } else {
            Duration::ZERO
        };
        model.slew_started = Some(Instant::now());
        model.believed = target;
        model.actual = landing;
        debug!(
            "Simulated slew to {} lands at {} ({:.2}° in {:.1}s)",
            target,
            landing,
            distance,
            model.slew_duration.as_secs_f64()
        );

        self.state.update(|state| {
            state.commanded = Some(target);
            state.status = MotionStatus::Slewing;
            state.last_error = None;
        });
        Ok(())
    }

    async fn sync_to(&self, actual: SkyCoordinate) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        let mut model = lock(&self.model);
        model.believed = actual;
        let (error_ra, error_dec) = model.model_error();
        info!(
            "Simulated sync to {}, residual model error ({:+.1}\", {:+.1}\")",
            actual,
            error_ra * ARCSEC_PER_DEG,
            error_dec * ARCSEC_PER_DEG
        );
        Ok(())
    }

    async fn wait_for_idle(&self, timeout: Duration) -> MountResult<MountState> {
        let _guard = self.lock.acquire().await;
        let result = poll_until_settled(
            || async { Ok(self.poll_status()) },
            self.poll_interval,
            timeout,
        )
        .await;
        match result {
            Ok(_) => Ok(self.state.snapshot()),
            Err(err) => {
                self.state.record_error(&err);
                Err(err)
            }
        }
    }

    fn state(&self) -> MountState {
        self.state.snapshot()
    }

    async fn abort_slew(&self) -> MountResult<()> {
        let _guard = self.lock.acquire().await;
        lock(&self.model).slew_started = None;
        self.state.set_status(MotionStatus::Idle);
        Ok(())
    }
}

/// Camera that photographs wherever a [`SimulatedMount`] truly points.
pub struct SimulatedCamera {
    config: CameraConfig,
    mount: Arc<SimulatedMount>,
    lock: DeviceLock,
    frame_number: AtomicU64,
    readout: Duration,
    seed: u64,
}

impl SimulatedCamera {
    pub fn new(config: CameraConfig, mount: Arc<SimulatedMount>) -> Self {
        Self {
            config,
            mount,
            lock: DeviceLock::new("simulated camera"),
            frame_number: AtomicU64::new(0),
            readout: Duration::from_millis(200),
            seed: 42,
        }
    }

    /// 1280x960 16-bit sensor, 3.75 µm pixels behind a 400 mm lens.
    pub fn with_default_sensor(mount: Arc<SimulatedMount>) -> Self {
        Self::new(
            CameraConfig {
                width: 1280,
                height: 960,
                bit_depth: 16,
                pixel_size_um: Some(3.75),
                focal_length_mm: Some(400.0),
            },
            mount,
        )
    }

    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn render(&self, pointing: &SkyCoordinate, frame_number: u64) -> Array2<u16> {
        let (width, height) = (self.config.width, self.config.height);
        let mut rng = StdRng::seed_from_u64(self.seed ^ frame_number);
        let mut data = Array2::from_shape_fn((height, width), |_| 800 + rng.gen_range(0..60u16));

        // Stars are fixed on the sky: seed their layout from the pointing
        // rounded to a tenth of a degree.
        let sky_cell = ((pointing.ra_deg() * 10.0) as u64) << 16 | ((pointing.dec_deg() + 90.0) * 10.0) as u64;
        let mut sky = StdRng::seed_from_u64(sky_cell ^ self.seed);
        let stars = (width * height / 20_000).max(5);
        let sigma = 1.8;
        for _ in 0..stars {
            let cx = sky.gen_range(0.0..width as f64);
            let cy = sky.gen_range(0.0..height as f64);
            let peak: f64 = sky.gen_range(1_500.0..50_000.0);
            let reach = (sigma * 4.0) as isize;
            for dy in -reach..=reach {
                for dx in -reach..=reach {
                    let (x, y) = (cx as isize + dx, cy as isize + dy);
                    if x < 0 || y < 0 || x >= width as isize || y >= height as isize {
                        continue;
                    }
                    let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                    let value = peak * (-r2 / (2.0 * sigma * sigma)).exp();
                    let pixel = &mut data[[y as usize, x as usize]];
                    *pixel = pixel.saturating_add(value as u16);
                }
            }
        }
        data
    }
}

#[async_trait]
impl CameraInterface for SimulatedCamera {
    fn name(&self) -> &str {
        "SimulatedCamera"
    }

    fn config(&self) -> &CameraConfig {
        &self.config
    }

    async fn is_ready(&self) -> CameraResult<bool> {
        Ok(true)
    }

    async fn capture(&self, request: &ExposureRequest) -> CameraResult<PixelFrame> {
        let _guard = self.lock.acquire().await;
        if self.config.width == 0 || self.config.height == 0 {
            return Err(CameraError::Config("sensor has zero size".to_string()));
        }

        let timestamp = Timestamp::now();
        tokio::time::sleep(request.exposure() + self.readout).await;

        let pointing = self.mount.true_pointing();
        let frame_number = self.frame_number.fetch_add(1, Ordering::SeqCst) + 1;
        let data = self.render(&pointing, frame_number);

        let mut metadata = FrameMetadata::new(frame_number, request.exposure(), timestamp);
        metadata.gain = request.gain();
        metadata.pointing = Some(pointing);
        metadata.temperatures.insert("sensor".to_string(), -10.0);

        let mut frame = PixelFrame::new(data, self.config.bit_depth, metadata);
        if let Some(scale) = self.config.pixel_scale() {
            frame = frame.with_pixel_scale(scale);
        }
        Ok(frame)
    }
}

/// Solver that reads the true pointing from frame metadata.
///
/// Frames without a recorded pointing never solve. Hinted solves fail when
/// the truth lies outside the search window, the way a real engine would.
pub struct SimulatedSolver {
    noise_deg: f64,
    failure_rate: f64,
    solve_time: Duration,
    rng: Mutex<StdRng>,
}

impl Default for SimulatedSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSolver {
    pub fn new() -> Self {
        Self {
            noise_deg: 2.0 / ARCSEC_PER_DEG,
            failure_rate: 0.0,
            solve_time: Duration::from_millis(500),
            rng: Mutex::new(StdRng::seed_from_u64(7)),
        }
    }

    /// Maximum per-axis error of a reported center, arcseconds.
    pub fn with_noise_arcsec(mut self, arcsec: f64) -> Self {
        self.noise_deg = arcsec / ARCSEC_PER_DEG;
        self
    }

    /// Probability in [0, 1] that a solve finds no match.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_solve_time(mut self, solve_time: Duration) -> Self {
        self.solve_time = solve_time;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *lock(&self.rng) = StdRng::seed_from_u64(seed);
        self
    }
}

#[async_trait]
impl PlateSolver for SimulatedSolver {
    fn name(&self) -> &str {
        "SimulatedSolver"
    }

    async fn solve(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> SolveResult {
        if let Err(failure) = check_frame(frame) {
            return SolveResult::Failed(failure);
        }
        tokio::time::sleep(self.solve_time).await;

        let Some(truth) = frame.metadata().pointing else {
            return SolveResult::Failed(SolveFailure::NoMatch);
        };
        if let Some(hint) = hint {
            if !hint.contains(&truth) {
                debug!("True pointing {} outside hint window {:?}", truth, hint);
                return SolveResult::Failed(SolveFailure::NoMatch);
            }
        }

        let (fails, noise_ra, noise_dec) = {
            let mut rng = lock(&self.rng);
            let fails = rng.gen::<f64>() < self.failure_rate;
            (fails, jitter(&mut rng, self.noise_deg), jitter(&mut rng, self.noise_deg))
        };
        if fails {
            return SolveResult::Failed(SolveFailure::NoMatch);
        }

        let cos_dec = truth.dec_rad().cos().max(1e-6);
        let center = apply_offset(&truth, noise_ra / cos_dec, noise_dec);
        SolveResult::Solved(Solution {
            center,
            pixel_scale: frame
                .pixel_scale()
                .unwrap_or_else(|| PixelScale::from_arcsec_per_pixel(1.5)),
            rotation_deg: 0.0,
            solve_time: self.solve_time,
        })
    }
}
