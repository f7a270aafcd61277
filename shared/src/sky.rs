//! Sky coordinate model.
//!
//! Immutable equatorial positions plus the small amount of spherical
//! trigonometry the correction loop needs: great-circle separation, offsets
//! that respect the coordinate ranges, and the pointing error between an
//! intended target and a solved image center.
//!
//! All angles crossing this API are in degrees unless a name says otherwise
//! (`ra_hours`, `*_rad`, `*_arcsec`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Arcseconds per degree.
pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// Errors produced when building or parsing coordinates.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinateError {
    /// Declination outside [-90, 90] or a non-finite component.
    #[error("invalid coordinate: RA {ra_deg}°, Dec {dec_deg}°")]
    InvalidCoordinate { ra_deg: f64, dec_deg: f64 },

    /// Text could not be read as an angle.
    #[error("cannot parse angle '{0}'")]
    Parse(String),
}

/// Reference frame tag carried with every coordinate.
///
/// The tag is bookkeeping only; no precession is applied between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Epoch {
    /// ICRS / J2000 catalog frame, as reported by plate solvers.
    #[default]
    J2000,
    /// Equinox of date, as used by many mount controllers.
    JNow,
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Epoch::J2000 => write!(f, "J2000"),
            Epoch::JNow => write!(f, "JNow"),
        }
    }
}

/// Equatorial sky position.
///
/// Invariants: `dec_deg` ∈ [-90, 90], `ra_deg` ∈ [0, 360). At either pole the
/// right ascension is normalized to zero so that equal points compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate", into = "RawCoordinate")]
pub struct SkyCoordinate {
    ra_deg: f64,
    dec_deg: f64,
    epoch: Epoch,
}

#[derive(Serialize, Deserialize)]
struct RawCoordinate {
    ra_deg: f64,
    dec_deg: f64,
    #[serde(default)]
    epoch: Epoch,
}

impl TryFrom<RawCoordinate> for SkyCoordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        SkyCoordinate::with_epoch(raw.ra_deg, raw.dec_deg, raw.epoch)
    }
}

impl From<SkyCoordinate> for RawCoordinate {
    fn from(coord: SkyCoordinate) -> Self {
        Self {
            ra_deg: coord.ra_deg,
            dec_deg: coord.dec_deg,
            epoch: coord.epoch,
        }
    }
}

impl SkyCoordinate {
    /// Create a J2000 coordinate from degrees.
    ///
    /// Right ascension is wrapped into [0, 360); declination must already be
    /// within [-90, 90].
    pub fn new(ra_deg: f64, dec_deg: f64) -> Result<Self, CoordinateError> {
        Self::with_epoch(ra_deg, dec_deg, Epoch::J2000)
    }

    /// Create a coordinate with an explicit frame tag.
    pub fn with_epoch(ra_deg: f64, dec_deg: f64, epoch: Epoch) -> Result<Self, CoordinateError> {
        if !ra_deg.is_finite() || !dec_deg.is_finite() || !(-90.0..=90.0).contains(&dec_deg) {
            return Err(CoordinateError::InvalidCoordinate { ra_deg, dec_deg });
        }
        Ok(Self::normalized(ra_deg, dec_deg, epoch))
    }

    /// Create a coordinate from right ascension in hours (the unit most mount
    /// protocols use on the wire).
    pub fn from_hours(ra_hours: f64, dec_deg: f64, epoch: Epoch) -> Result<Self, CoordinateError> {
        Self::with_epoch(ra_hours * 15.0, dec_deg, epoch)
    }

    /// Parse a right ascension / declination pair (see [`parse_ra`] and [`parse_dec`]).
    pub fn parse(ra: &str, dec: &str) -> Result<Self, CoordinateError> {
        Self::new(parse_ra(ra)?, parse_dec(dec)?)
    }

    fn normalized(ra_deg: f64, dec_deg: f64, epoch: Epoch) -> Self {
        let ra_deg = if dec_deg.abs() >= 90.0 {
            0.0
        } else {
            wrap_degrees(ra_deg)
        };
        Self {
            ra_deg,
            dec_deg,
            epoch,
        }
    }

    pub fn ra_deg(&self) -> f64 {
        self.ra_deg
    }

    pub fn dec_deg(&self) -> f64 {
        self.dec_deg
    }

    pub fn ra_hours(&self) -> f64 {
        self.ra_deg / 15.0
    }

    pub fn ra_rad(&self) -> f64 {
        self.ra_deg.to_radians()
    }

    pub fn dec_rad(&self) -> f64 {
        self.dec_deg.to_radians()
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Same position with a different frame tag.
    pub fn retagged(&self, epoch: Epoch) -> Self {
        Self { epoch, ..*self }
    }

    /// Great-circle distance to `other` in degrees.
    pub fn separation(&self, other: &SkyCoordinate) -> f64 {
        angular_separation(self, other)
    }

    /// Position angle of `other` as seen from `self`, degrees east of north in [0, 360).
    pub fn position_angle_to(&self, other: &SkyCoordinate) -> f64 {
        let (dec1, dec2) = (self.dec_rad(), other.dec_rad());
        let dra = other.ra_rad() - self.ra_rad();
        let y = dra.sin();
        let x = dec1.cos() * dec2.tan() - dec1.sin() * dra.cos();
        if x == 0.0 && y == 0.0 {
            return 0.0;
        }
        wrap_degrees(y.atan2(x).to_degrees())
    }

    /// Coordinate offsets `(delta_ra_deg, delta_dec_deg)` that take `self` to `other`,
    /// with the RA difference wrapped into (-180, 180].
    pub fn offset_to(&self, other: &SkyCoordinate) -> (f64, f64) {
        (
            wrap_signed_degrees(other.ra_deg - self.ra_deg),
            other.dec_deg - self.dec_deg,
        )
    }

    /// See [`apply_offset`].
    pub fn offset_by(&self, delta_ra_deg: f64, delta_dec_deg: f64) -> Self {
        apply_offset(self, delta_ra_deg, delta_dec_deg)
    }
}

impl fmt::Display for SkyCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RA {} Dec {} ({})",
            format_hms(self.ra_deg),
            format_dms(self.dec_deg),
            self.epoch
        )
    }
}

/// Great-circle distance between two coordinates in degrees.
///
/// Uses the Vincenty form, which stays accurate for both tiny and antipodal
/// separations. The arguments are put in a canonical order first so the
/// result is bit-for-bit symmetric.
pub fn angular_separation(a: &SkyCoordinate, b: &SkyCoordinate) -> f64 {
    let (first, second) = if (a.ra_deg, a.dec_deg) <= (b.ra_deg, b.dec_deg) {
        (a, b)
    } else {
        (b, a)
    };

    let (dec1, dec2) = (first.dec_rad(), second.dec_rad());
    let dra = second.ra_rad() - first.ra_rad();
    let (sin_dra, cos_dra) = dra.sin_cos();

    let num1 = dec2.cos() * sin_dra;
    let num2 = dec1.cos() * dec2.sin() - dec1.sin() * dec2.cos() * cos_dra;
    let den = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * cos_dra;

    num1.hypot(num2).atan2(den).to_degrees()
}

/// Shift a coordinate by raw RA/Dec deltas in degrees.
///
/// The declination is clamped to [-90, 90] and the right ascension wrapped
/// modulo 360. Non-finite deltas are treated as zero.
pub fn apply_offset(coord: &SkyCoordinate, delta_ra_deg: f64, delta_dec_deg: f64) -> SkyCoordinate {
    let delta_ra_deg = if delta_ra_deg.is_finite() { delta_ra_deg } else { 0.0 };
    let delta_dec_deg = if delta_dec_deg.is_finite() { delta_dec_deg } else { 0.0 };

    let dec_deg = (coord.dec_deg + delta_dec_deg).clamp(-90.0, 90.0);
    SkyCoordinate::normalized(coord.ra_deg + delta_ra_deg, dec_deg, coord.epoch)
}

/// Wrap an angle into [0, 360).
pub fn wrap_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Wrap an angle into (-180, 180].
pub fn wrap_signed_degrees(deg: f64) -> f64 {
    let wrapped = wrap_degrees(deg);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Plate scale of an imaging train.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelScale {
    arcsec_per_pixel: f64,
}

impl PixelScale {
    pub fn from_arcsec_per_pixel(arcsec_per_pixel: f64) -> Self {
        Self { arcsec_per_pixel }
    }

    /// Plate scale from pixel pitch and focal length (206.265 arcsec·mm/µm).
    pub fn from_optics(pixel_size_um: f64, focal_length_mm: f64) -> Self {
        Self::from_arcsec_per_pixel(206.264_806 * pixel_size_um / focal_length_mm)
    }

    pub fn arcsec_per_pixel(&self) -> f64 {
        self.arcsec_per_pixel
    }

    pub fn deg_per_pixel(&self) -> f64 {
        self.arcsec_per_pixel / ARCSEC_PER_DEG
    }

    /// Angular extent of `pixels` pixels in degrees.
    pub fn field_of_view_deg(&self, pixels: usize) -> f64 {
        self.deg_per_pixel() * pixels as f64
    }
}

/// Offset between the intended target and where an image says the telescope points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointingError {
    /// Great-circle distance in degrees
    pub magnitude_deg: f64,
    /// Direction of the solved center from the target, degrees east of north
    pub position_angle_deg: f64,
    /// Raw RA difference (solved - target), wrapped into (-180, 180]
    pub delta_ra_deg: f64,
    /// Dec difference (solved - target)
    pub delta_dec_deg: f64,
}

impl PointingError {
    /// Error of `solved` relative to `target`.
    pub fn between(target: &SkyCoordinate, solved: &SkyCoordinate) -> Self {
        let (delta_ra_deg, delta_dec_deg) = target.offset_to(solved);
        Self {
            magnitude_deg: angular_separation(target, solved),
            position_angle_deg: target.position_angle_to(solved),
            delta_ra_deg,
            delta_dec_deg,
        }
    }

    pub fn magnitude_arcsec(&self) -> f64 {
        self.magnitude_deg * ARCSEC_PER_DEG
    }

    /// True when the error is at or below `tolerance_deg`.
    pub fn within(&self, tolerance_deg: f64) -> bool {
        self.magnitude_deg <= tolerance_deg
    }
}

impl fmt::Display for PointingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:.1}\" (PA {:.1}°, ΔRA {:+.5}°, ΔDec {:+.5}°)",
            self.magnitude_arcsec(),
            self.position_angle_deg,
            self.delta_ra_deg,
            self.delta_dec_deg
        )
    }
}

/// Parse a right ascension into degrees.
///
/// Sexagesimal input (`05:35:17.3`, `5h35m17.3s`) and decimal input with an
/// `h` suffix (`5.588h`) are read as hours; a bare decimal is read as degrees.
pub fn parse_ra(text: &str) -> Result<f64, CoordinateError> {
    let trimmed = text.trim();
    let is_hours = trimmed.contains(':') || trimmed.contains(['h', 'H']);
    let value = if is_hours {
        parse_sexagesimal(trimmed)? * 15.0
    } else {
        parse_decimal(trimmed)?
    };
    Ok(value)
}

/// Parse a declination into degrees.
///
/// Accepts `-05:23:28`, `-5d23m28s`, `-5°23'28"` or a bare decimal.
pub fn parse_dec(text: &str) -> Result<f64, CoordinateError> {
    let trimmed = text.trim();
    if trimmed.contains([':', 'd', 'D', '°', '\'']) {
        parse_sexagesimal(trimmed)
    } else {
        parse_decimal(trimmed)
    }
}

fn parse_decimal(text: &str) -> Result<f64, CoordinateError> {
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CoordinateError::Parse(text.to_string()))
}

fn parse_sexagesimal(text: &str) -> Result<f64, CoordinateError> {
    let parse_err = || CoordinateError::Parse(text.to_string());

    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let normalized: String = body
        .chars()
        .map(|c| match c {
            'h' | 'H' | 'd' | 'D' | 'm' | 'M' | 's' | 'S' | '°' | '\'' | '"' | ' ' => ':',
            other => other,
        })
        .collect();

    let parts: Vec<f64> = normalized
        .split(':')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>().map_err(|_| parse_err()))
        .collect::<Result<_, _>>()?;

    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(parse_err());
    }
    if parts.iter().skip(1).any(|p| *p >= 60.0) {
        return Err(parse_err());
    }

    let magnitude = parts
        .iter()
        .zip([1.0, 60.0, 3600.0])
        .map(|(value, divisor)| value / divisor)
        .sum::<f64>();

    Ok(if negative { -magnitude } else { magnitude })
}

/// Format a right ascension in degrees as `HHhMMmSS.Ss`.
pub fn format_hms(ra_deg: f64) -> String {
    const TENTHS_PER_DAY: i64 = 24 * 36_000;
    let tenths = ((wrap_degrees(ra_deg) / 15.0) * 36_000.0).round() as i64 % TENTHS_PER_DAY;
    let hours = tenths / 36_000;
    let minutes = (tenths / 600) % 60;
    let seconds = (tenths % 600) as f64 / 10.0;
    format!("{hours:02}h{minutes:02}m{seconds:04.1}s")
}

/// Format a declination in degrees as `±DD°MM'SS.S"`.
pub fn format_dms(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let tenths = (dec_deg.abs() * 36_000.0).round() as i64;
    let degrees = tenths / 36_000;
    let minutes = (tenths / 600) % 60;
    let seconds = (tenths % 600) as f64 / 10.0;
    format!("{sign}{degrees:02}°{minutes:02}'{seconds:04.1}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn coord(ra: f64, dec: f64) -> SkyCoordinate {
        SkyCoordinate::new(ra, dec).unwrap()
    }

    #[test]
    fn test_construction_rejects_bad_declination() {
        assert!(SkyCoordinate::new(10.0, 90.5).is_err());
        assert!(SkyCoordinate::new(10.0, -91.0).is_err());
        assert!(SkyCoordinate::new(f64::NAN, 0.0).is_err());
        assert!(SkyCoordinate::new(0.0, f64::INFINITY).is_err());
        assert!(SkyCoordinate::new(0.0, 90.0).is_ok());
    }

    #[test]
    fn test_construction_wraps_right_ascension() {
        assert_abs_diff_eq!(coord(370.0, 0.0).ra_deg(), 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(coord(-10.0, 0.0).ra_deg(), 350.0, epsilon = 1e-12);
        assert_eq!(coord(360.0, 0.0).ra_deg(), 0.0);
        assert!(coord(-1e-18, 0.0).ra_deg() < 360.0);
    }

    #[test]
    fn test_poles_normalize_right_ascension() {
        assert_eq!(coord(123.0, 90.0), coord(0.0, 90.0));
        assert_eq!(angular_separation(&coord(45.0, -90.0), &coord(200.0, -90.0)), 0.0);
    }

    #[test]
    fn test_separation_self_is_zero() {
        for &(ra, dec) in &[(0.0, 0.0), (10.0, 20.0), (359.9, -89.0), (180.0, 45.5)] {
            let c = coord(ra, dec);
            assert_eq!(angular_separation(&c, &c), 0.0);
        }
    }

    #[test]
    fn test_separation_is_symmetric() {
        let points = [
            coord(10.0, 20.0),
            coord(10.02, 20.0),
            coord(359.99, -45.0),
            coord(0.01, -45.0),
            coord(200.0, 89.9),
            coord(20.0, -89.9),
        ];
        for a in &points {
            for b in &points {
                assert_eq!(angular_separation(a, b), angular_separation(b, a));
            }
        }
    }

    #[test]
    fn test_separation_known_values() {
        assert_abs_diff_eq!(
            angular_separation(&coord(0.0, 0.0), &coord(90.0, 0.0)),
            90.0,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            angular_separation(&coord(0.0, 90.0), &coord(0.0, -90.0)),
            180.0,
            epsilon = 1e-9
        );
        // Across the RA wrap
        assert_abs_diff_eq!(
            angular_separation(&coord(359.5, 0.0), &coord(0.5, 0.0)),
            1.0,
            epsilon = 1e-9
        );
        // RA difference shrinks with cos(dec)
        assert_abs_diff_eq!(
            angular_separation(&coord(10.0, 20.0), &coord(10.02, 20.0)),
            0.02 * 20f64.to_radians().cos(),
            epsilon = 1e-7
        );
    }

    #[test]
    fn test_apply_offset_clamps_and_wraps() {
        let near_pole = coord(100.0, 89.5);
        let moved = apply_offset(&near_pole, 0.0, 2.0);
        assert_eq!(moved.dec_deg(), 90.0);

        let near_south = coord(100.0, -89.5);
        assert_eq!(apply_offset(&near_south, 0.0, -5.0).dec_deg(), -90.0);

        let wrapped = apply_offset(&coord(359.0, 0.0), 2.0, 0.0);
        assert_abs_diff_eq!(wrapped.ra_deg(), 1.0, epsilon = 1e-12);

        let wrapped_back = apply_offset(&coord(1.0, 0.0), -2.0, 0.0);
        assert_abs_diff_eq!(wrapped_back.ra_deg(), 359.0, epsilon = 1e-12);
    }

    #[test]
    fn test_apply_offset_range_sweep() {
        let deltas = [-725.0, -360.0, -90.0, -0.5, 0.0, 0.5, 45.0, 180.0, 359.999, 1000.0];
        let mut dec = -90.0;
        while dec <= 90.0 {
            let start = coord(123.4, dec);
            for &dra in &deltas {
                for &ddec in &deltas {
                    let out = apply_offset(&start, dra, ddec);
                    assert!((-90.0..=90.0).contains(&out.dec_deg()));
                    assert!((0.0..360.0).contains(&out.ra_deg()));
                }
            }
            dec += 7.5;
        }
    }

    #[test]
    fn test_apply_offset_ignores_non_finite_delta() {
        let start = coord(10.0, 10.0);
        assert_eq!(apply_offset(&start, f64::NAN, f64::INFINITY), start);
    }

    #[test]
    fn test_offset_to_wraps_ra() {
        let (dra, ddec) = coord(359.0, 10.0).offset_to(&coord(1.0, 11.0));
        assert_abs_diff_eq!(dra, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ddec, 1.0, epsilon = 1e-12);

        let (dra, _) = coord(1.0, 10.0).offset_to(&coord(359.0, 10.0));
        assert_abs_diff_eq!(dra, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_position_angle_cardinal_directions() {
        let origin = coord(10.0, 0.0);
        assert_abs_diff_eq!(origin.position_angle_to(&coord(10.0, 1.0)), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(origin.position_angle_to(&coord(11.0, 0.0)), 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(origin.position_angle_to(&coord(10.0, -1.0)), 180.0, epsilon = 1e-9);
        assert_abs_diff_eq!(origin.position_angle_to(&coord(9.0, 0.0)), 270.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pointing_error_worked_example() {
        let target = coord(10.0, 20.0);

        let first = PointingError::between(&target, &coord(10.02, 20.0));
        assert_abs_diff_eq!(first.magnitude_deg, 0.0188, epsilon = 1e-4);
        assert!(!first.within(0.01));

        let second = PointingError::between(&target, &coord(10.002, 20.001));
        assert_abs_diff_eq!(second.magnitude_deg, 0.0022, epsilon = 1e-4);
        assert!(second.within(0.01));
    }

    #[test]
    fn test_pixel_scale_from_optics() {
        // 3.76 µm pixels at 400 mm focal length
        let scale = PixelScale::from_optics(3.76, 400.0);
        assert_abs_diff_eq!(scale.arcsec_per_pixel(), 1.9389, epsilon = 1e-3);
        assert_abs_diff_eq!(
            scale.field_of_view_deg(3600),
            scale.arcsec_per_pixel(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_parse_ra_forms() {
        assert_abs_diff_eq!(parse_ra("05:35:17.3").unwrap(), 83.822083, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_ra("5h35m17.3s").unwrap(), 83.822083, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_ra("6h").unwrap(), 90.0, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_ra("83.5").unwrap(), 83.5, epsilon = 1e-12);
        assert!(parse_ra("abc").is_err());
        assert!(parse_ra("05:75:00").is_err());
    }

    #[test]
    fn test_parse_dec_forms() {
        assert_abs_diff_eq!(parse_dec("-05:23:28").unwrap(), -5.391111, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_dec("-5d23m28s").unwrap(), -5.391111, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_dec("-5°23'28\"").unwrap(), -5.391111, epsilon = 1e-5);
        assert_abs_diff_eq!(parse_dec("-00:30:00").unwrap(), -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(parse_dec("+20").unwrap(), 20.0, epsilon = 1e-12);
        assert!(parse_dec("").is_err());
    }

    #[test]
    fn test_display_formats() {
        let m42 = SkyCoordinate::parse("05:35:17.3", "-05:23:28").unwrap();
        assert_eq!(format_hms(m42.ra_deg()), "05h35m17.3s");
        assert_eq!(format_dms(m42.dec_deg()), "-05°23'28.0\"");
        // Rounding carries into the next field
        assert_eq!(format_hms(359.99999999), "00h00m00.0s");
        assert_eq!(format_dms(29.99999999), "+30°00'00.0\"");
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let c = SkyCoordinate::with_epoch(12.5, -30.0, Epoch::JNow).unwrap();
        let json = serde_json::to_string(&c).unwrap();
        let back: SkyCoordinate = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);

        let bad = r#"{"ra_deg": 10.0, "dec_deg": 95.0}"#;
        assert!(serde_json::from_str::<SkyCoordinate>(bad).is_err());
    }
}
