//! Source finding and initial-parameter estimation for tilted-ring fits.
//!
//! The finder detects the galaxy in the cube with a dual-threshold
//! connected-component search (runs → per-channel 2D objects → 3D
//! detections, with optional growth to a secondary threshold), and the
//! guesser derives first-guess ring geometry from the brightest detection's
//! intensity and velocity-field maps.

pub mod grower;
pub mod guess;
pub mod object2d;
pub mod object3d;
pub mod scan;
pub mod search;

pub use guess::{IncAlgorithm, PaAlgorithm, ParamGuess};
pub use object2d::Object2D;
pub use object3d::Detection;
pub use scan::Scan;
pub use search::{search, SearchError, SearchKind, SearchOptions};
