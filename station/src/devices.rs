//! Device selection from the command line.

use crate::simulated::{SimulatedCamera, SimulatedMount, SimulatedSolver};
use anyhow::{bail, Context, Result};
use astrometry::nova::NOVA_BASE_URL;
use astrometry::{LocalSolver, LocalSolverConfig, NovaClient, NovaConfig};
use clap::{Args, ValueEnum};
use hardware::alpaca::{AlpacaCamera, AlpacaClient, AlpacaTelescope, Optics, DEFAULT_REQUEST_TIMEOUT};
use shared::camera_interface::CameraInterface;
use shared::mount_interface::MountInterface;
use shared::plate_solver::PlateSolver;
use shared::sky::{apply_offset, SkyCoordinate};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// ASCOM Alpaca telescope
    Alpaca,
    /// Simulated mount with a pointing model error
    Sim,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraKind {
    /// ASCOM Alpaca camera
    Alpaca,
    /// Simulated camera attached to the simulated mount
    Sim,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    /// Local astrometry.net `solve-field`
    Local,
    /// nova.astrometry.net web service
    Nova,
    /// Reads the simulated camera's true pointing
    Sim,
}

/// Camera and mount selection.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    #[arg(long, value_enum, default_value_t = MountKind::Alpaca, help = "Mount backend")]
    pub mount: MountKind,

    #[arg(long, value_enum, default_value_t = CameraKind::Alpaca, help = "Camera backend")]
    pub camera: CameraKind,

    #[arg(
        long,
        default_value = "http://localhost:11111",
        help = "Base URL of the Alpaca server"
    )]
    pub alpaca_url: String,

    #[arg(long, default_value_t = 0, help = "Alpaca telescope device number")]
    pub telescope_number: u32,

    #[arg(long, default_value_t = 0, help = "Alpaca camera device number")]
    pub camera_number: u32,

    #[arg(
        long,
        help = "Focal length of the imaging train in millimeters",
        long_help = "Used with the camera's pixel size to estimate the plate scale, which \
            narrows the solver's scale search. Omit to let the solver search all scales."
    )]
    pub focal_length_mm: Option<f64>,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Simulated mount pointing model error in degrees (both axes)"
    )]
    pub sim_model_error_deg: f64,

    #[arg(long, default_value_t = 3.0, help = "Simulated slew landing scatter in arcseconds")]
    pub sim_slew_scatter_arcsec: f64,

    #[arg(long, help = "Seed for the simulated devices")]
    pub sim_seed: Option<u64>,
}

/// Plate solver selection.
#[derive(Args, Debug, Clone)]
pub struct SolverArgs {
    #[arg(long, value_enum, default_value_t = SolverKind::Local, help = "Plate solver backend")]
    pub solver: SolverKind,

    #[arg(long, default_value = "solve-field", help = "Path to the solve-field executable")]
    pub solve_field: PathBuf,

    #[arg(long, default_value_t = 30, help = "CPU time limit for solve-field in seconds")]
    pub cpu_limit_secs: u64,

    #[arg(long, env = "NOVA_API_KEY", hide_env_values = true, help = "nova.astrometry.net API key")]
    pub nova_api_key: Option<String>,

    #[arg(long, default_value = NOVA_BASE_URL, help = "nova.astrometry.net base URL")]
    pub nova_url: String,

    #[arg(long, default_value_t = 2.0, help = "Simulated solver noise in arcseconds")]
    pub sim_noise_arcsec: f64,

    #[arg(long, default_value_t = 0.0, help = "Simulated solver failure probability")]
    pub sim_failure_rate: f64,
}

/// Connected devices, ready to hand to a corrector.
pub struct Devices {
    pub camera: Arc<dyn CameraInterface>,
    pub mount: Arc<dyn MountInterface>,
    pub solver: Arc<dyn PlateSolver>,
    alpaca_camera: Option<Arc<AlpacaCamera>>,
    alpaca_mount: Option<Arc<AlpacaTelescope>>,
}

impl Devices {
    /// Release Alpaca devices. Errors are logged, not returned.
    pub async fn disconnect(&self) {
        if let Some(camera) = &self.alpaca_camera {
            if let Err(e) = camera.disconnect().await {
                warn!("Failed to disconnect camera: {e}");
            }
        }
        if let Some(mount) = &self.alpaca_mount {
            if let Err(e) = mount.disconnect().await {
                warn!("Failed to disconnect telescope: {e}");
            }
        }
    }
}

/// Build the plate solver selected on the command line.
pub fn build_solver(args: &SolverArgs) -> Result<Arc<dyn PlateSolver>> {
    let solver: Arc<dyn PlateSolver> = match args.solver {
        SolverKind::Local => {
            let config = LocalSolverConfig {
                binary: args.solve_field.clone(),
                cpu_limit: Duration::from_secs(args.cpu_limit_secs),
                wall_timeout: Duration::from_secs(args.cpu_limit_secs * 3),
                ..Default::default()
            };
            Arc::new(LocalSolver::new(config))
        }
        SolverKind::Nova => {
            let Some(api_key) = args.nova_api_key.clone().filter(|k| !k.is_empty()) else {
                bail!("--solver nova needs an API key (--nova-api-key or NOVA_API_KEY)");
            };
            let config = NovaConfig {
                base_url: args.nova_url.clone(),
                api_key,
                ..Default::default()
            };
            Arc::new(NovaClient::new(config).context("Failed to create nova client")?)
        }
        SolverKind::Sim => Arc::new(
            SimulatedSolver::new()
                .with_noise_arcsec(args.sim_noise_arcsec)
                .with_failure_rate(args.sim_failure_rate),
        ),
    };
    info!("Using plate solver {}", solver.name());
    Ok(solver)
}

/// Connect the camera, mount and solver.
///
/// `target` seeds the simulated mount: it starts near the target, off by the
/// configured model error.
pub async fn connect(
    devices: &DeviceArgs,
    solver: &SolverArgs,
    target: SkyCoordinate,
) -> Result<Devices> {
    if devices.camera == CameraKind::Sim && devices.mount != MountKind::Sim {
        bail!("--camera sim needs --mount sim: the simulated camera images the simulated sky");
    }
    if solver.solver == SolverKind::Sim && devices.camera != CameraKind::Sim {
        warn!("--solver sim only solves frames from --camera sim; every solve will fail");
    }

    let solver = build_solver(solver)?;
    let needs_alpaca = devices.mount == MountKind::Alpaca || devices.camera == CameraKind::Alpaca;
    let client = if needs_alpaca {
        Some(
            AlpacaClient::new(&devices.alpaca_url, DEFAULT_REQUEST_TIMEOUT)
                .with_context(|| format!("Invalid Alpaca URL {}", devices.alpaca_url))?,
        )
    } else {
        None
    };

    let mut simulated_mount = None;
    let mut alpaca_mount = None;
    let mount: Arc<dyn MountInterface> = match (devices.mount, &client) {
        (MountKind::Alpaca, Some(client)) => {
            let telescope = Arc::new(
                AlpacaTelescope::connect(client, devices.telescope_number)
                    .await
                    .context("Failed to connect to telescope")?,
            );
            alpaca_mount = Some(telescope.clone());
            telescope
        }
        _ => {
            let error = devices.sim_model_error_deg;
            // Start where a badly aligned goto to the target would have landed.
            let actual = apply_offset(&target, -error, -error);
            let mut mount = SimulatedMount::new(actual, error, error)
                .with_slew_scatter_arcsec(devices.sim_slew_scatter_arcsec);
            if let Some(seed) = devices.sim_seed {
                mount = mount.with_seed(seed);
            }
            let mount = Arc::new(mount);
            simulated_mount = Some(mount.clone());
            mount
        }
    };

    let mut alpaca_camera = None;
    let camera: Arc<dyn CameraInterface> = match (devices.camera, &client, simulated_mount) {
        (CameraKind::Alpaca, Some(client), _) => {
            let optics = Optics {
                focal_length_mm: devices.focal_length_mm,
            };
            let camera = Arc::new(
                AlpacaCamera::connect(client, devices.camera_number, optics)
                    .await
                    .context("Failed to connect to camera")?,
            );
            alpaca_camera = Some(camera.clone());
            camera
        }
        (CameraKind::Sim, _, Some(mount)) => {
            let mut camera = SimulatedCamera::with_default_sensor(mount);
            if let Some(seed) = devices.sim_seed {
                camera = camera.with_seed(seed);
            }
            Arc::new(camera)
        }
        _ => bail!("No camera backend available for {:?}", devices.camera),
    };

    info!(
        "Devices ready: camera {}, mount {}, solver {}",
        camera.name(),
        mount.name(),
        solver.name()
    );
    Ok(Devices {
        camera,
        mount,
        solver,
        alpaca_camera,
        alpaca_mount,
    })
}
