//! Plate solve a single image file and print the solution as JSON.
//!
//! ```text
//! solve_image frame.png --arcsec-per-pixel 1.93
//! solve_image frame.png --ra 83.82 --dec -5.39 --radius 2 --solver nova
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use shared::image_io::load_frame;
use shared::plate_solver::{SolveHint, SolveResult};
use shared::sky::{PixelScale, SkyCoordinate};
use station::devices::{build_solver, SolverArgs};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Plate solve one image")]
struct Args {
    #[arg(help = "Image file (PNG, JPEG or TIFF)")]
    image: PathBuf,

    #[arg(long, allow_hyphen_values = true, requires = "dec", help = "Hint right ascension")]
    ra: Option<String>,

    #[arg(long, allow_hyphen_values = true, requires = "ra", help = "Hint declination")]
    dec: Option<String>,

    #[arg(long, default_value_t = 5.0, help = "Hint search radius in degrees")]
    radius: f64,

    #[arg(
        long,
        help = "Approximate plate scale in arcseconds per pixel",
        long_help = "Approximate plate scale. Narrows the solver's scale search; \
            omit to search all scales."
    )]
    arcsec_per_pixel: Option<f64>,

    #[command(flatten)]
    solver: SolverArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    station::init_tracing();
    let args = Args::parse();

    let hint = match hint(&args) {
        Ok(hint) => hint,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(2);
        }
    };

    match solve(&args, hint.as_ref()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn hint(args: &Args) -> Result<Option<SolveHint>> {
    let (Some(ra), Some(dec)) = (&args.ra, &args.dec) else {
        return Ok(None);
    };
    if !(args.radius.is_finite() && args.radius > 0.0) {
        bail!("Search radius must be positive, got {}", args.radius);
    }
    let center = SkyCoordinate::parse(ra, dec).context("Invalid hint position")?;
    Ok(Some(SolveHint::new(center, args.radius)))
}

/// Returns whether the image solved.
async fn solve(args: &Args, hint: Option<&SolveHint>) -> Result<bool> {
    let mut frame =
        load_frame(&args.image).with_context(|| format!("Failed to load {}", args.image.display()))?;
    if let Some(scale) = args.arcsec_per_pixel {
        frame = frame.with_pixel_scale(PixelScale::from_arcsec_per_pixel(scale));
    }
    info!(
        "Loaded {} ({}x{})",
        args.image.display(),
        frame.width(),
        frame.height()
    );

    let solver = build_solver(&args.solver)?;
    let result = solver.solve(&frame, hint).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match &result {
        SolveResult::Solved(solution) => info!("Solved: center {}", solution.center),
        SolveResult::Failed(failure) => error!("No solution: {failure}"),
    }
    Ok(result.is_solved())
}
