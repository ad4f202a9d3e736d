//! Driver layer of the tilted-ring pipeline: parameter files, ring tables,
//! FITS cubes and run orchestration.

pub mod driver;
pub mod fits;
pub mod params;
pub mod ringio;

pub use driver::{run, DriverError, RunSummary};
pub use params::{ParamError, Params, RingValue};
