//! Test helpers for the pointing-correction workspace.
//!
//! Logging setup, coordinate shorthands and synthetic frames used across the
//! crates' unit and integration tests.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::camera_interface::{FrameMetadata, PixelFrame, Timestamp};
use shared::sky::{PixelScale, SkyCoordinate};
use std::time::Duration;

/// Route `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// J2000 coordinate from degrees.
///
/// # Panics
/// If `dec` is outside [-90, 90].
pub fn coord(ra: f64, dec: f64) -> SkyCoordinate {
    SkyCoordinate::new(ra, dec).expect("test coordinate out of range")
}

/// Assert two coordinates are within `tolerance_deg` of each other on the sky.
#[track_caller]
pub fn assert_coord_near(actual: &SkyCoordinate, expected: &SkyCoordinate, tolerance_deg: f64) {
    let separation = actual.separation(expected);
    assert!(
        separation <= tolerance_deg,
        "{actual} is {separation:.6}° from {expected}, tolerance {tolerance_deg}°"
    );
}

/// Render a deterministic star field: flat background, uniform noise and
/// a handful of Gaussian stars.
pub fn star_field(width: usize, height: usize, seed: u64) -> Array2<u16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Array2::from_shape_fn((height, width), |_| 500 + rng.gen_range(0..40u16));

    let stars = ((width * height) / 2000).max(3);
    for _ in 0..stars {
        let cx = rng.gen_range(0.0..width as f64);
        let cy = rng.gen_range(0.0..height as f64);
        let peak = rng.gen_range(2_000.0..40_000.0);
        let sigma: f64 = 1.5;
        let reach = (sigma * 4.0).ceil() as isize;

        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let x = cx as isize + dx;
                let y = cy as isize + dy;
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

/// A small synthetic frame with a 1.5"/px nominal plate scale.
pub fn synthetic_frame(width: usize, height: usize, frame_number: u64) -> PixelFrame {
    let metadata = FrameMetadata::new(
        frame_number,
        Duration::from_secs(2),
        Timestamp::new(1_700_000_000 + frame_number, 0),
    );
    PixelFrame::new(star_field(width, height, frame_number), 16, metadata)
        .with_pixel_scale(PixelScale::from_arcsec_per_pixel(1.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_field_is_deterministic() {
        let a = star_field(64, 48, 7);
        let b = star_field(64, 48, 7);
        assert_eq!(a, b);
        assert_eq!(a.dim(), (48, 64));
        assert!(a.iter().any(|&v| v > 1_000));
    }

    #[test]
    fn test_synthetic_frame_metadata() {
        let frame = synthetic_frame(32, 16, 4);
        assert_eq!(frame.width(), 32);
        assert_eq!(frame.height(), 16);
        assert_eq!(frame.metadata().frame_number, 4);
        assert!(frame.pixel_scale().is_some());
    }

    #[test]
    fn test_assert_coord_near_accepts_wraparound() {
        assert_coord_near(&coord(359.9995, 0.0), &coord(0.0, 0.0), 0.001);
    }

    #[test]
    #[should_panic]
    fn test_assert_coord_near_rejects_distant() {
        assert_coord_near(&coord(10.0, 20.0), &coord(10.1, 20.0), 0.01);
    }
}
