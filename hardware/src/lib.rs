//! Hardware bindings for pointing correction.
//!
//! Concrete camera and mount adapters implementing the capability traits
//! from `shared`.

pub mod alpaca;

pub use alpaca::{AlpacaCamera, AlpacaClient, AlpacaError, AlpacaTelescope};
