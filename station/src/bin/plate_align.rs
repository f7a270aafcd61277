//! Closed-loop pointing correction from the command line.
//!
//! Captures a frame, plate solves it, syncs the mount to the solved position
//! and re-slews to the target until the pointing error is within tolerance.
//!
//! ```text
//! plate_align --ra 05:35:17 --dec -05:23:28 --focal-length-mm 400
//! plate_align --ra 83.82 --dec -5.39 --mount sim --camera sim --solver sim
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use pointing::{ConfigurationError, CorrectionConfig, PointingCorrector, RunRequest};
use shared::config_storage::ConfigStorage;
use shared::sky::SkyCoordinate;
use station::devices::{self, DeviceArgs, SolverArgs};
use station::report;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Plate-solve pointing correction")]
struct Args {
    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Target right ascension",
        long_help = "Target right ascension as decimal degrees (83.82) or sexagesimal \
            hours (05:35:17.3 or \"5h35m17s\")."
    )]
    ra: String,

    #[arg(
        long,
        allow_hyphen_values = true,
        help = "Target declination",
        long_help = "Target declination as decimal degrees (-5.39) or sexagesimal \
            degrees (-05:23:28 or \"-5d23m28s\")."
    )]
    dec: String,

    #[arg(long, default_value_t = 5, help = "Maximum capture/solve/correct attempts")]
    max_attempts: u32,

    #[arg(long, default_value_t = 0.01, help = "Convergence tolerance in degrees")]
    tolerance_deg: f64,

    #[arg(long, default_value_t = 5.0, help = "Exposure time in seconds")]
    exposure: f64,

    #[arg(long, help = "Camera gain (camera default when omitted)")]
    gain: Option<f64>,

    #[command(flatten)]
    correction: CorrectionConfig,

    #[command(flatten)]
    devices: DeviceArgs,

    #[command(flatten)]
    solver: SolverArgs,

    #[arg(long, help = "Slew to the target before the first capture")]
    goto: bool,

    #[arg(long, help = "Directory to save every captured frame as PNG")]
    save_frames: Option<PathBuf>,

    #[arg(long, help = "Write the attempt history as JSON to this file")]
    history_json: Option<PathBuf>,

    #[arg(
        long,
        help = "Load correction settings from a saved profile",
        long_help = "Load timeouts, backoff and search radius settings from a profile saved \
            with --save-profile. Profile values replace the command-line correction settings."
    )]
    profile: Option<String>,

    #[arg(long, help = "Save the effective correction settings as a named profile")]
    save_profile: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    station::init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            let usage = e.downcast_ref::<ConfigurationError>().is_some()
                || e.downcast_ref::<shared::sky::CoordinateError>().is_some();
            ExitCode::from(if usage { 2 } else { 1 })
        }
    }
}

fn correction_settings(args: &Args) -> Result<CorrectionConfig> {
    let mut config = args.correction.clone();
    if args.profile.is_none() && args.save_profile.is_none() {
        return Ok(config);
    }

    let storage = ConfigStorage::new().context("Cannot open profile storage")?;
    if let Some(name) = &args.profile {
        match storage.load_profile::<CorrectionConfig>(name) {
            Some(loaded) => {
                config = loaded.with_context(|| format!("Failed to load profile '{name}'"))?;
                info!("Loaded correction profile '{name}'");
            }
            None => warn!("Profile '{name}' not found, using command-line settings"),
        }
    }
    if let Some(name) = &args.save_profile {
        config.validate()?;
        storage
            .save_profile(name, &config)
            .with_context(|| format!("Failed to save profile '{name}'"))?;
    }
    Ok(config)
}

/// Returns whether the run converged.
async fn run(args: Args) -> Result<bool> {
    let target = SkyCoordinate::parse(&args.ra, &args.dec)?;
    let config = correction_settings(&args)?;
    let request = RunRequest::new(target)
        .with_max_attempts(args.max_attempts)
        .with_tolerance_deg(args.tolerance_deg)
        .with_exposure_secs(args.exposure)
        .with_gain(args.gain);
    request.validate()?;
    config.validate()?;

    info!("Target {target}, tolerance {:.4}°", request.tolerance_deg);
    let devices = devices::connect(&args.devices, &args.solver, target).await?;
    let result = correct(&args, &devices, config, request).await;
    devices.disconnect().await;
    result
}

async fn correct(
    args: &Args,
    devices: &devices::Devices,
    config: CorrectionConfig,
    request: RunRequest,
) -> Result<bool> {
    if args.goto {
        info!("Slewing to {}", request.target);
        devices
            .mount
            .slew_to(request.target)
            .await
            .context("Initial slew failed")?;
        devices
            .mount
            .wait_for_idle(config.motion_timeout())
            .await
            .context("Initial slew did not settle")?;
    }

    let corrector = PointingCorrector::new(
        devices.camera.clone(),
        devices.mount.clone(),
        devices.solver.clone(),
        config,
    )?;
    report::log_events(&corrector);
    if let Some(dir) = &args.save_frames {
        report::save_frames(&corrector, dir.clone())?;
    }

    let handle = corrector.spawn(request)?;
    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the correction loop");
            cancel.cancel();
        }
    });

    let session = handle.session();
    let outcome = handle.join().await;
    interrupt.abort();

    println!("{}", report::summary(&session, &outcome));
    if let Some(path) = &args.history_json {
        report::write_history(&session, path)?;
    }
    Ok(outcome.is_converged())
}
