//! Reading and writing frames as ordinary image files.
//!
//! Frames are written as 16-bit grayscale PNG, which every solver front end
//! accepts and which preserves the full sensor range. Loading accepts any
//! format the `image` crate was built with and widens it to 16 bits.

use crate::camera_interface::{FrameMetadata, PixelFrame, Timestamp};
use image::{ImageBuffer, Luma};
use ndarray::Array2;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageIoError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame is empty")]
    EmptyFrame,
}

/// Convert a raster to a 16-bit grayscale image buffer.
///
/// Rows of the array map to image rows (y), columns to x.
pub fn array2_to_gray16_image(data: &Array2<u16>) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    let (height, width) = data.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Luma([data[[y as usize, x as usize]]])
    })
}

/// Convert a 16-bit image buffer back to a raster.
pub fn gray16_image_to_array2(image: &ImageBuffer<Luma<u16>, Vec<u16>>) -> Array2<u16> {
    let (width, height) = image.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32)[0]
    })
}

/// Save a frame as a 16-bit grayscale PNG.
pub fn save_frame_png(frame: &PixelFrame, path: &Path) -> Result<(), ImageIoError> {
    if frame.is_empty() {
        return Err(ImageIoError::EmptyFrame);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let data = frame.data().to_owned();
    array2_to_gray16_image(&data).save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Encode a frame as 16-bit grayscale PNG bytes, for uploads.
pub fn encode_png(frame: &PixelFrame) -> Result<Vec<u8>, ImageIoError> {
    if frame.is_empty() {
        return Err(ImageIoError::EmptyFrame);
    }
    let data = frame.data().to_owned();
    let mut bytes = Vec::new();
    array2_to_gray16_image(&data)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

/// Conventional file name for a captured frame inside `dir`.
pub fn frame_path(dir: &Path, frame: &PixelFrame) -> PathBuf {
    let metadata = frame.metadata();
    dir.join(format!(
        "frame_{:04}_{}.png",
        metadata.frame_number, metadata.timestamp.seconds
    ))
}

/// Load an image file as a frame.
///
/// The exposure is unknown for files on disk, so it is recorded as zero and
/// the timestamp as the load time.
pub fn load_frame(path: &Path) -> Result<PixelFrame, ImageIoError> {
    let image = image::open(path)?.into_luma16();
    let data = gray16_image_to_array2(&image);
    if data.is_empty() {
        return Err(ImageIoError::EmptyFrame);
    }
    let metadata = FrameMetadata::new(0, Duration::ZERO, Timestamp::now());
    Ok(PixelFrame::new(data, 16, metadata))
}
