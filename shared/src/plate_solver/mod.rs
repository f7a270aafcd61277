//! Plate solver abstraction.
//!
//! A plate solver matches the star pattern in a frame against a catalog and
//! reports the sky coordinate at the image center. Solvers never retry on
//! their own; the caller decides whether to widen the search and try again.

pub mod mock;

use crate::camera_interface::PixelFrame;
use crate::sky::{PixelScale, SkyCoordinate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Search window for a hinted solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveHint {
    /// Approximate image center
    pub center: SkyCoordinate,
    /// Search radius around `center` in degrees
    pub search_radius_deg: f64,
}

impl SolveHint {
    pub fn new(center: SkyCoordinate, search_radius_deg: f64) -> Self {
        Self {
            center,
            search_radius_deg,
        }
    }

    /// True when `coord` falls inside the search window.
    pub fn contains(&self, coord: &SkyCoordinate) -> bool {
        self.center.separation(coord) <= self.search_radius_deg
    }
}

/// Astrometric solution of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Sky coordinate of the image center
    pub center: SkyCoordinate,
    /// Measured plate scale
    pub pixel_scale: PixelScale,
    /// Field rotation, degrees east of north
    pub rotation_deg: f64,
    /// Wall time the engine took
    pub solve_time: Duration,
}

/// Why a solve produced no solution.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolveFailure {
    /// Engine ran but found no catalog match
    #[error("no match found")]
    NoMatch,

    /// Engine did not finish within the allowed time
    #[error("solve timed out after {0:?}")]
    Timeout(Duration),

    /// Frame cannot be solved at all (empty, wrong size, unreadable)
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Engine hit a transient fault (connection dropped, server error)
    #[error("solver service error: {0}")]
    ServiceError(String),

    /// Engine cannot be run (binary missing, bad credentials or configuration)
    #[error("solver unavailable: {0}")]
    EngineUnavailable(String),
}

/// Result of one solve call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SolveResult {
    Solved(Solution),
    Failed(SolveFailure),
}

impl SolveResult {
    pub fn solution(&self) -> Option<&Solution> {
        match self {
            SolveResult::Solved(solution) => Some(solution),
            SolveResult::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SolveFailure> {
        match self {
            SolveResult::Solved(_) => None,
            SolveResult::Failed(failure) => Some(failure),
        }
    }

    pub fn is_solved(&self) -> bool {
        matches!(self, SolveResult::Solved(_))
    }
}

impl From<SolveFailure> for SolveResult {
    fn from(failure: SolveFailure) -> Self {
        SolveResult::Failed(failure)
    }
}

/// Reject frames no engine could solve.
pub fn check_frame(frame: &PixelFrame) -> Result<(), SolveFailure> {
    if frame.is_empty() || frame.width() == 0 || frame.height() == 0 {
        return Err(SolveFailure::InvalidFrame(format!(
            "empty raster {}x{}",
            frame.width(),
            frame.height()
        )));
    }
    Ok(())
}

/// Trait for plate-solving engines.
///
/// `solve` may take seconds to minutes. Dropping the returned future abandons
/// the solve; implementations that run external work must stop it on drop.
#[async_trait]
pub trait PlateSolver: Send + Sync {
    /// Get solver name/identifier
    fn name(&self) -> &str;

    /// Solve `frame`, restricted to `hint` when given, otherwise blind.
    async fn solve(&self, frame: &PixelFrame, hint: Option<&SolveHint>) -> SolveResult;
}
