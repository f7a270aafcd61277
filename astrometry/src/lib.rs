//! Plate-solver clients.
//!
//! * [`LocalSolver`] runs astrometry.net's `solve-field` on this machine.
//! * [`NovaClient`] submits frames to the nova.astrometry.net web service.
//!
//! Both implement [`shared::plate_solver::PlateSolver`] and report failures
//! through [`shared::plate_solver::SolveFailure`] rather than retrying.

pub mod nova;
pub mod solve_field;
pub mod wcs;

pub use nova::{NovaClient, NovaConfig};
pub use solve_field::{LocalSolver, LocalSolverConfig};
