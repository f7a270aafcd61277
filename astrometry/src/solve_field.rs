//! Local plate solving with astrometry.net's `solve-field`.
//!
//! Each solve writes the frame as a 16-bit PNG into a fresh temporary
//! directory, runs `solve-field` there and reads back the `.wcs` header it
//! leaves behind. The child process is killed if the solve future is
//! dropped, so cancelling a run never leaves an orphaned solver behind.

use crate::wcs::read_wcs_file;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::camera_interface::PixelFrame;
use shared::image_io::{save_frame_png, ImageIoError};
use shared::plate_solver::{check_frame, PlateSolver, SolveFailure, SolveHint, SolveResult, Solution};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

const IMAGE_NAME: &str = "frame.png";
const BASE_NAME: &str = "frame";

/// Settings for the local solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSolverConfig {
    /// Path to the `solve-field` executable
    pub binary: PathBuf,
    /// CPU time the engine may spend before giving up (`--cpulimit`)
    pub cpu_limit: Duration,
    /// Wall-clock bound on the whole process
    pub wall_timeout: Duration,
    /// Fractional tolerance around the frame's nominal plate scale
    pub scale_tolerance: f64,
    /// Downsample factor passed to source extraction
    pub downsample: Option<u32>,
    /// Extra arguments appended verbatim before the image path
    pub extra_args: Vec<String>,
}

impl Default for LocalSolverConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("solve-field"),
            cpu_limit: Duration::from_secs(30),
            wall_timeout: Duration::from_secs(90),
            scale_tolerance: 0.2,
            downsample: Some(2),
            extra_args: Vec::new(),
        }
    }
}

/// Plate solver backed by a local astrometry.net installation.
#[derive(Debug, Clone)]
pub struct LocalSolver {
    config: LocalSolverConfig,
}

impl LocalSolver {
    pub fn new(config: LocalSolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LocalSolverConfig {
        &self.config
    }

    /// Command-line arguments for one solve.
    pub fn command_args(
        &self,
        image: &Path,
        out_dir: &Path,
        frame: &PixelFrame,
        hint: Option<&SolveHint>,
    ) -> Vec<String> {
        let mut args: Vec<String> = [
            "--overwrite",
            "--no-plots",
            "--no-verify",
            "--crpix-center",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("--cpulimit".into());
        args.push(self.config.cpu_limit.as_secs().max(1).to_string());
        args.push("--dir".into());
        args.push(out_dir.display().to_string());
        for output in ["--new-fits", "--corr", "--rdls", "--match", "--index-xyls"] {
            args.push(output.into());
            args.push("none".into());
        }

        if let Some(hint) = hint {
            args.push("--ra".into());
            args.push(format!("{:.6}", hint.center.ra_deg()));
            args.push("--dec".into());
            args.push(format!("{:.6}", hint.center.dec_deg()));
            args.push("--radius".into());
            args.push(format!("{:.4}", hint.search_radius_deg));
        }

        if let Some(scale) = frame.pixel_scale() {
            let nominal = scale.arcsec_per_pixel();
            let tol = self.config.scale_tolerance.clamp(0.0, 0.95);
            args.push("--scale-units".into());
            args.push("arcsecperpix".into());
            args.push("--scale-low".into());
            args.push(format!("{:.4}", nominal * (1.0 - tol)));
            args.push("--scale-high".into());
            args.push(format!("{:.4}", nominal * (1.0 + tol)));
        }

        if let Some(downsample) = self.config.downsample {
            args.push("--downsample".into());
            args.push(downsample.to_string());
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push(image.display().to_string());
        args
    }

    async fn run(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> Result<Solution, SolveFailure> {
        check_frame(frame)?;

        let work_dir = tempfile::tempdir()
            .map_err(|e| SolveFailure::EngineUnavailable(format!("temp dir: {e}")))?;
        let image_path = work_dir.path().join(IMAGE_NAME);
        write_frame(frame.clone(), image_path.clone()).await?;

        let args = self.command_args(&image_path, work_dir.path(), frame, hint);
        debug!("Running {} {}", self.config.binary.display(), args.join(" "));

        let start = Instant::now();
        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SolveFailure::EngineUnavailable(format!(
                    "cannot start {}: {e}",
                    self.config.binary.display()
                ))
            })?;

        let output = tokio::time::timeout(self.config.wall_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                warn!(
                    "solve-field exceeded {:?}, killing",
                    self.config.wall_timeout
                );
                SolveFailure::Timeout(self.config.wall_timeout)
            })?
            .map_err(|e| SolveFailure::EngineUnavailable(format!("waiting for solver: {e}")))?;
        let solve_time = start.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(SolveFailure::EngineUnavailable(format!(
                "solve-field exited with {}: {}",
                output.status, tail
            )));
        }

        let solved_marker = work_dir.path().join(format!("{BASE_NAME}.solved"));
        let wcs_path = work_dir.path().join(format!("{BASE_NAME}.wcs"));
        if !solved_marker.exists() || !wcs_path.exists() {
            debug!(
                "solve-field found no match in {:.1}s",
                solve_time.as_secs_f64()
            );
            return Err(SolveFailure::NoMatch);
        }

        let wcs = read_wcs_file(&wcs_path).map_err(|e| {
            warn!("Unreadable WCS output: {e}");
            SolveFailure::NoMatch
        })?;

        Ok(Solution {
            center: wcs.center,
            pixel_scale: wcs.pixel_scale,
            rotation_deg: wcs.rotation_deg,
            solve_time,
        })
    }
}

/// Encode and write the frame on the blocking pool.
async fn write_frame(frame: PixelFrame, path: PathBuf) -> Result<(), SolveFailure> {
    let written = tokio::task::spawn_blocking(move || save_frame_png(&frame, &path))
        .await
        .map_err(|e| SolveFailure::EngineUnavailable(format!("writing frame: {e}")))?;
    written.map_err(|e| match e {
        ImageIoError::EmptyFrame => SolveFailure::InvalidFrame(e.to_string()),
        other => SolveFailure::EngineUnavailable(format!("writing frame: {other}")),
    })
}

#[async_trait]
impl PlateSolver for LocalSolver {
    fn name(&self) -> &str {
        "solve-field"
    }

    async fn solve(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> SolveResult {
        match self.run(frame, hint).await {
            Ok(solution) => {
                info!(
                    "Solved: {} ({:.2}\"/px, rot {:.1}°) in {:.1}s",
                    solution.center,
                    solution.pixel_scale.arcsec_per_pixel(),
                    solution.rotation_deg,
                    solution.solve_time.as_secs_f64()
                );
                SolveResult::Solved(solution)
            }
            Err(failure) => {
                info!("Solve failed: {failure}");
                SolveResult::Failed(failure)
            }
        }
    }
}
