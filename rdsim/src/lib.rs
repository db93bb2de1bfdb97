//! rdsim: a particle-based stochastic reaction-diffusion simulator, in the
//! spirit of MCell.  Molecules take Brownian steps through triangle-mesh
//! geometry, reacting on collision and on exponential unimolecular timers,
//! all driven by one global event queue so a fixed seed reproduces a run
//! exactly.

pub mod base;
pub mod checkpoint;
pub mod counts;
pub mod diffusion;
pub mod geometry;
pub mod model;
pub mod molecule;
pub mod partition;
pub mod reaction;
pub mod scheduler;
pub mod species;
pub mod state;
pub mod system;
