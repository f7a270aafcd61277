//! Minimal FITS header reader for WCS solutions.
//!
//! `solve-field` writes its solution as a header-only FITS file (`.wcs`):
//! 80-character keyword records terminated by `END` and padded to a
//! 2880-byte block. Only the TAN projection keywords are interpreted.

use shared::sky::{wrap_signed_degrees, PixelScale, SkyCoordinate, ARCSEC_PER_DEG};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

const CARD_LEN: usize = 80;
const BLOCK_LEN: usize = 2880;

#[derive(Error, Debug)]
pub enum WcsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("header has no END record")]
    Truncated,

    #[error("missing keyword {0}")]
    MissingKeyword(&'static str),

    #[error("invalid WCS: {0}")]
    Invalid(String),
}

/// Value of one header keyword.
#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

/// Parsed FITS header (keyword → value, comments dropped).
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    keywords: HashMap<String, FitsValue>,
}

impl FitsHeader {
    pub fn get(&self, key: &str) -> Option<&FitsValue> {
        self.keywords.get(key)
    }

    /// Numeric value, accepting integer cards too.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.keywords.get(key)? {
            FitsValue::Float(f) => Some(*f),
            FitsValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.keywords.get(key)? {
            FitsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    fn require(&self, key: &'static str) -> Result<f64, WcsError> {
        self.get_float(key).ok_or(WcsError::MissingKeyword(key))
    }
}

/// Parse the primary header from raw FITS bytes.
pub fn parse_header(bytes: &[u8]) -> Result<FitsHeader, WcsError> {
    let mut header = FitsHeader::default();

    for card in bytes.chunks(CARD_LEN) {
        let record = String::from_utf8_lossy(card);
        let keyword = record.get(..8.min(record.len())).unwrap_or("").trim();

        if keyword == "END" {
            return Ok(header);
        }
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            continue;
        }
        if record.get(8..10) == Some("= ") {
            let value = parse_value(&record[10..]);
            header.keywords.insert(keyword.to_string(), value);
        }
    }

    Err(WcsError::Truncated)
}

fn parse_value(raw: &str) -> FitsValue {
    let s = raw.trim();

    if let Some(rest) = s.strip_prefix('\'') {
        if let Some(end) = rest.find('\'') {
            return FitsValue::String(rest[..end].trim_end().to_string());
        }
    }

    let value_part = match s.find('/') {
        Some(idx) => s[..idx].trim(),
        None => s,
    };

    match value_part {
        "T" => return FitsValue::Boolean(true),
        "F" => return FitsValue::Boolean(false),
        _ => {}
    }

    if let Ok(i) = value_part.parse::<i64>() {
        return FitsValue::Integer(i);
    }
    if let Ok(f) = value_part.replace(['D', 'd'], "E").parse::<f64>() {
        return FitsValue::Float(f);
    }
    FitsValue::String(value_part.to_string())
}

/// Read and parse a header-only FITS file.
pub fn read_header_file(path: &Path) -> Result<FitsHeader, WcsError> {
    let bytes = std::fs::read(path)?;
    parse_header(&bytes)
}

/// Linear part of a TAN projection, degrees per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CdMatrix {
    cd11: f64,
    cd12: f64,
    cd21: f64,
    cd22: f64,
}

impl CdMatrix {
    fn from_header(header: &FitsHeader) -> Result<Self, WcsError> {
        if let (Some(cd11), Some(cd12), Some(cd21), Some(cd22)) = (
            header.get_float("CD1_1"),
            header.get_float("CD1_2"),
            header.get_float("CD2_1"),
            header.get_float("CD2_2"),
        ) {
            return Ok(Self {
                cd11,
                cd12,
                cd21,
                cd22,
            });
        }

        let cdelt1 = header.require("CDELT1")?;
        let cdelt2 = header.require("CDELT2")?;
        let rho = header.get_float("CROTA2").unwrap_or(0.0).to_radians();
        Ok(Self {
            cd11: cdelt1 * rho.cos(),
            cd12: -cdelt2 * rho.sin(),
            cd21: cdelt1 * rho.sin(),
            cd22: cdelt2 * rho.cos(),
        })
    }

    fn scale_deg(&self) -> f64 {
        (self.cd11 * self.cd22 - self.cd12 * self.cd21).abs().sqrt()
    }

    fn rotation_deg(&self) -> f64 {
        wrap_signed_degrees((-self.cd12).atan2(self.cd22).to_degrees())
    }
}

/// Center, plate scale and rotation read from a WCS header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WcsSolution {
    pub center: SkyCoordinate,
    pub pixel_scale: PixelScale,
    pub rotation_deg: f64,
}

/// Gnomonic (TAN) deprojection of intermediate coordinates (degrees) around
/// the reference point.
fn deproject(reference: &SkyCoordinate, xi_deg: f64, eta_deg: f64) -> (f64, f64) {
    let xi = xi_deg.to_radians();
    let eta = eta_deg.to_radians();
    let ra0 = reference.ra_rad();
    let dec0 = reference.dec_rad();

    let denom = dec0.cos() - eta * dec0.sin();
    let ra = ra0 + xi.atan2(denom);
    let dec = (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt());
    (ra.to_degrees(), dec.to_degrees())
}

/// Interpret a TAN WCS header.
///
/// When the image size is recorded (`IMAGEW`/`IMAGEH`) the reported center
/// is the sky position of the image center, otherwise the reference value
/// `CRVAL1/2`.
pub fn solution_from_header(header: &FitsHeader) -> Result<WcsSolution, WcsError> {
    if let Some(ctype) = header.get_string("CTYPE1") {
        if !ctype.contains("TAN") {
            return Err(WcsError::Invalid(format!("unsupported projection {ctype}")));
        }
    }

    let crval1 = header.require("CRVAL1")?;
    let crval2 = header.require("CRVAL2")?;
    let reference = SkyCoordinate::new(crval1, crval2)
        .map_err(|e| WcsError::Invalid(e.to_string()))?;
    let cd = CdMatrix::from_header(header)?;

    let scale_deg = cd.scale_deg();
    if !scale_deg.is_finite() || scale_deg <= 0.0 {
        return Err(WcsError::Invalid("singular CD matrix".to_string()));
    }

    let center = match (
        header.get_float("IMAGEW"),
        header.get_float("IMAGEH"),
        header.get_float("CRPIX1"),
        header.get_float("CRPIX2"),
    ) {
        (Some(w), Some(h), Some(crpix1), Some(crpix2)) => {
            // FITS pixel centers are 1-based
            let dx = (w + 1.0) / 2.0 - crpix1;
            let dy = (h + 1.0) / 2.0 - crpix2;
            let xi = cd.cd11 * dx + cd.cd12 * dy;
            let eta = cd.cd21 * dx + cd.cd22 * dy;
            let (ra, dec) = deproject(&reference, xi, eta);
            SkyCoordinate::new(ra, dec).map_err(|e| WcsError::Invalid(e.to_string()))?
        }
        _ => reference,
    };

    Ok(WcsSolution {
        center,
        pixel_scale: PixelScale::from_arcsec_per_pixel(scale_deg * ARCSEC_PER_DEG),
        rotation_deg: cd.rotation_deg(),
    })
}

/// Read a `.wcs` file and interpret it.
pub fn read_wcs_file(path: &Path) -> Result<WcsSolution, WcsError> {
    solution_from_header(&read_header_file(path)?)
}

/// Format header cards into a FITS header block.
///
/// Each `(keyword, value)` pair becomes one 80-character record; values are
/// written verbatim after `= `.
pub fn format_header(cards: &[(&str, String)]) -> Vec<u8> {
    let mut out = String::new();
    for (keyword, value) in cards {
        let record = format!("{keyword:<8}= {value:>20}");
        out.push_str(&format!("{record:<80}"));
    }
    out.push_str(&format!("{:<80}", "END"));
    let padding = (BLOCK_LEN - out.len() % BLOCK_LEN) % BLOCK_LEN;
    out.push_str(&" ".repeat(padding));
    out.into_bytes()
}
