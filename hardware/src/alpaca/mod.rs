//! ASCOM Alpaca device bindings.
//!
//! Alpaca exposes the ASCOM device interfaces (the same `Telescope` and
//! `Camera` object model the Windows COM drivers implement) as a REST API,
//! so one HTTP client covers every vendor with an Alpaca server or the ASCOM
//! Remote bridge.

mod camera;
mod client;
mod telescope;

pub use camera::{decode_image_array, AlpacaCamera, Optics};
pub use client::{
    AlpacaClient, AlpacaDevice, AlpacaError, AlpacaResult, DeviceType, DEFAULT_REQUEST_TIMEOUT,
    INVALID_OPERATION, NOT_CONNECTED,
};
pub use telescope::AlpacaTelescope;
