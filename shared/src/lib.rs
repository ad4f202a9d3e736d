//! Shared components for the tilted-ring modelling pipeline.
//!
//! This crate contains the data model (cube, header, rings), the coordinate
//! and beam kernels, robust statistics, and the small numerical algorithms
//! (downhill simplex, polynomial/Bézier smoothing) that the synthesiser,
//! fitter and source finder build on.

pub mod algo;
pub mod beam;
pub mod cancel;
pub mod cube;
pub mod geometry;
pub mod header;
pub mod progress;
pub mod rings;
pub mod stats;

pub use cancel::CancelToken;
pub use cube::Cube;
pub use header::{Beam, Header, SpectralKind, VelocityDef};
pub use rings::{FitParam, Ring, RingSet};
