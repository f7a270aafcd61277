//! Shared components for the pointing-correction workspace.
//!
//! This crate holds the value types and capability traits that every other
//! crate builds on: the sky coordinate model, the camera, mount and plate
//! solver interfaces (plus in-memory mocks of each), frame image I/O and the
//! on-disk profile store.

pub mod camera_interface;
pub mod config_storage;
pub mod device_lock;
pub mod image_io;
pub mod mount_interface;
pub mod plate_solver;
pub mod sky;

pub use sky::{angular_separation, apply_offset, Epoch, PixelScale, PointingError, SkyCoordinate};
