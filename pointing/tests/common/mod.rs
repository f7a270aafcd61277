//! Common fixtures for pointing tests

#![allow(dead_code)]

use pointing::{CorrectionConfig, PointingCorrector, RunEvent, RunRequest};
use shared::camera_interface::mock::MockCamera;
use shared::camera_interface::CameraConfig;
use shared::mount_interface::mock::MockMount;
use shared::plate_solver::mock::ScriptedSolver;
use shared::plate_solver::SolveResult;
use shared::sky::SkyCoordinate;
use std::sync::{Arc, Mutex};
use test_helpers::{coord, init_logging, star_field};

/// Mock devices wired into a corrector.
pub struct Rig {
    pub camera: Arc<MockCamera>,
    pub mount: Arc<MockMount>,
    pub solver: Arc<ScriptedSolver>,
    pub corrector: PointingCorrector,
}

impl Rig {
    pub fn new(mount_position: SkyCoordinate, results: Vec<SolveResult>) -> Self {
        Self::with_config(mount_position, results, fast_config())
    }

    pub fn with_config(
        mount_position: SkyCoordinate,
        results: Vec<SolveResult>,
        config: CorrectionConfig,
    ) -> Self {
        Self::from_parts(
            MockMount::new(mount_position),
            ScriptedSolver::new(results),
            config,
        )
    }

    pub fn from_parts(mount: MockMount, solver: ScriptedSolver, config: CorrectionConfig) -> Self {
        Self::with_camera(camera(), mount, solver, config)
    }

    pub fn with_camera(
        camera: MockCamera,
        mount: MockMount,
        solver: ScriptedSolver,
        config: CorrectionConfig,
    ) -> Self {
        init_logging();
        let camera = Arc::new(camera);
        let mount = Arc::new(mount);
        let solver = Arc::new(solver);
        let corrector = PointingCorrector::new(
            camera.clone(),
            mount.clone(),
            solver.clone(),
            config,
        )
        .unwrap();

        Self {
            camera,
            mount,
            solver,
            corrector,
        }
    }

    /// Collect every event the corrector emits.
    pub fn record_events(&self) -> Arc<Mutex<Vec<RunEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        self.corrector
            .register_callback(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }
}

/// 64x48 star field camera with instant readout.
pub fn camera() -> MockCamera {
    let camera_config = CameraConfig {
        width: 64,
        height: 48,
        bit_depth: 16,
        pixel_size_um: Some(3.76),
        focal_length_mm: Some(530.0),
    };
    MockCamera::new(camera_config, star_field(64, 48, 1))
}

/// Short timeouts and a 1 s backoff.
pub fn fast_config() -> CorrectionConfig {
    CorrectionConfig {
        capture_timeout_secs: 10.0,
        solve_timeout_secs: 30.0,
        motion_timeout_secs: 10.0,
        retry_backoff_secs: 1.0,
        ..Default::default()
    }
}

pub fn target() -> SkyCoordinate {
    coord(10.0, 20.0)
}

pub fn request(max_attempts: u32) -> RunRequest {
    RunRequest::new(target())
        .with_max_attempts(max_attempts)
        .with_tolerance_deg(0.01)
        .with_exposure_secs(2.0)
}
