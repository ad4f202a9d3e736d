//! The scalar objective the simplex minimises: a masked, weighted residual
//! between the observation and a single-ring synthetic cube.
//!
//! Evaluating a candidate ring synthesises only that ring, into a bounding
//! region around its projected annulus padded by one ring width, and
//! reduces the residual over the voxels that pass both the run mask and the
//! annulus test. Azimuthal weighting favours points near the major axis,
//! where rotation projects fully into the line of sight.

use ndarray::Array3;
use thiserror::Error;

use galmod::{GalmodOptions, Region};
use shared::beam::{self, BeamError};
use shared::cube::Cube;
use shared::geometry::RingProjection;
use shared::header::Header;
use shared::rings::Ring;
use shared::stats::{self, StatsError, ThresholdSpec};

use finder::{search, SearchError, SearchOptions};

/// Residual reduction applied voxel by voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FType {
    /// Sum of (m - o)^2 / sigma^2.
    Chi2,
    /// Sum of |m - o|.
    AbsDiff,
    /// Sum of |m - o| / (m + o + eps).
    FracDiff,
}

impl FType {
    pub fn from_code(code: i64) -> Option<FType> {
        match code {
            1 => Some(FType::Chi2),
            2 => Some(FType::AbsDiff),
            3 => Some(FType::FracDiff),
            _ => None,
        }
    }
}

/// Azimuthal weighting, with theta measured from the major axis in the
/// disk plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WFunc {
    Uniform,
    AbsCos,
    Cos2,
}

impl WFunc {
    pub fn from_code(code: i64) -> Option<WFunc> {
        match code {
            0 => Some(WFunc::Uniform),
            1 => Some(WFunc::AbsCos),
            2 => Some(WFunc::Cos2),
            _ => None,
        }
    }

    fn weight(&self, theta: f64) -> f64 {
        match self {
            WFunc::Uniform => 1.0,
            WFunc::AbsCos => theta.cos().abs(),
            WFunc::Cos2 => theta.cos().powi(2),
        }
    }
}

/// Which half of the disk enters the residual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Both,
    Approaching,
    Receding,
}

impl Side {
    fn admits(&self, theta: f64) -> bool {
        match self {
            Side::Both => true,
            Side::Receding => theta.cos() >= 0.0,
            Side::Approaching => theta.cos() <= 0.0,
        }
    }
}

/// Which voxels of the observation participate in the fit.
#[derive(Debug, Clone, Copy)]
pub enum MaskKind {
    /// Voxels where a beam-smoothed observation exceeds an SNR cut.
    Smoothing { factor: f64, snr_cut: f64 },
    /// Voxels belonging to any detection of the source finder.
    Searching,
    /// Smooth first, then search the smoothed cube.
    SmoothAndSearch { factor: f64 },
    /// Voxels above an absolute flux value.
    Threshold(f64),
    /// Voxels below zero, for noise calibration.
    Negative,
    /// Every finite voxel.
    None,
}

#[derive(Error, Debug)]
pub enum MaskError {
    #[error(transparent)]
    Beam(#[from] BeamError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Search(#[from] SearchError),
}

/// Build the boolean run mask for the whole cube.
pub fn build_mask(
    cube: &Cube,
    header: &Header,
    kind: &MaskKind,
) -> Result<Array3<bool>, MaskError> {
    let finite = |v: f64| v.is_finite();
    let mask = match kind {
        MaskKind::None => cube.data().mapv(finite),
        MaskKind::Negative => cube.data().mapv(|v| v.is_finite() && v < 0.0),
        MaskKind::Threshold(t) => cube.data().mapv(|v| v.is_finite() && v > *t),
        MaskKind::Smoothing { factor, snr_cut } => {
            let smoothed = smoothed_copy(cube, header, *factor)?;
            let flat = smoothed
                .as_slice()
                .expect("smoothed cube is contiguous by construction");
            let s = stats::compute(flat, None)?;
            let cut = ThresholdSpec::Snr(*snr_cut).resolve(&s);
            smoothed.mapv(|v| v.is_finite() && v > cut)
        }
        MaskKind::Searching => detection_mask(cube, header)?,
        MaskKind::SmoothAndSearch { factor } => {
            let smoothed = Cube::from_array(smoothed_copy(cube, header, *factor)?);
            detection_mask(&smoothed, header)?
        }
    };
    Ok(mask)
}

fn smoothed_copy(cube: &Cube, header: &Header, factor: f64) -> Result<Array3<f64>, BeamError> {
    let kernel = beam::kernel2d(&header.beam, header.pixscale, factor)?;
    let mut smoothed = cube.data().clone();
    beam::smooth_cube(&mut smoothed, &kernel, true);
    Ok(smoothed)
}

fn detection_mask(cube: &Cube, header: &Header) -> Result<Array3<bool>, SearchError> {
    let detections = search(cube, header, &SearchOptions::default())?;
    let mut mask = Array3::from_elem(cube.dims(), false);
    for det in &detections {
        for (x, y, z) in det.voxels() {
            mask[[x, y, z]] = true;
        }
    }
    Ok(mask)
}

/// Everything fixed across one ring's simplex run.
pub struct ResidualEvaluator<'a> {
    pub cube: &'a Cube,
    pub header: &'a Header,
    pub mask: &'a Array3<bool>,
    /// Noise level for the chi-squared reduction.
    pub noise_sigma: f64,
    pub ftype: FType,
    pub wfunc: WFunc,
    pub side: Side,
    /// Synthesis options for the candidate ring; the fitter forces
    /// sequential emission here and owns the outer parallelism.
    pub galmod: GalmodOptions,
}

impl<'a> ResidualEvaluator<'a> {
    /// Objective value for one candidate ring. Returns +inf when the model
    /// deposits nothing on the grid or no valid voxel enters the sum, so
    /// the simplex reflects away.
    pub fn evaluate(&self, ring: &Ring, ring_index: usize) -> f64 {
        // Pad by a full ring width for safety, plus the beam support when
        // the model is smoothed.
        let mut margin = ring.width;
        if self.galmod.smooth {
            margin += 3.0 * self.header.beam.bmaj.max(0.0);
        }
        let region = Region::around_ring(self.header, ring, margin);

        let model =
            match galmod::synthesise_ring(self.header, ring, ring_index, &self.galmod, &region, None)
            {
                Ok(m) => m,
                Err(_) => return f64::INFINITY,
            };
        let model_total: f64 = model.iter().sum();
        if model_total <= 0.0 {
            return f64::INFINITY;
        }

        let proj = RingProjection::new(
            ring.inc,
            ring.pa,
            ring.xpos,
            ring.ypos,
            self.header.pixscale,
        );
        // The synthesis region is padded, but the residual is reduced over
        // the candidate's own annulus only; flux from neighbouring rings
        // must not enter the sum.
        let (r_lo, r_hi) = ring.bounds();

        let nz = self.header.naxis[2];
        let sigma2 = self.noise_sigma * self.noise_sigma;
        let mut total = 0.0;
        let mut used = 0usize;

        let (gx, gy, _) = self.cube.dims();
        for rx in 0..region.nx {
            for ry in 0..region.ny {
                let x = rx as isize + region.x0;
                let y = ry as isize + region.y0;
                if x < 0 || y < 0 || x as usize >= gx || y as usize >= gy {
                    continue;
                }
                let (radius, theta) = proj.from_pixel(x as f64, y as f64);
                if radius < r_lo || radius > r_hi || !self.side.admits(theta) {
                    continue;
                }
                let weight = self.wfunc.weight(theta);
                if weight == 0.0 {
                    continue;
                }
                let (x, y) = (x as usize, y as usize);
                for z in 0..nz {
                    if !self.mask[[x, y, z]] {
                        continue;
                    }
                    let obs = self.cube.get(x, y, z);
                    if !obs.is_finite() {
                        continue;
                    }
                    let m = model[[rx, ry, z]];
                    total += match self.ftype {
                        FType::Chi2 => weight * (m - obs) * (m - obs) / sigma2,
                        FType::AbsDiff => weight * (m - obs).abs(),
                        FType::FracDiff => weight * (m - obs).abs() / ((m + obs).abs() + 1.0e-10),
                    };
                    used += 1;
                }
            }
        }

        if used == 0 {
            return f64::INFINITY;
        }
        total
    }

    /// True when at least one masked, finite voxel lies inside the ring's
    /// annulus (padded by one width). Rings failing this are degenerate
    /// and skipped by the fitter.
    pub fn has_data(&self, ring: &Ring) -> bool {
        let region = Region::around_ring(self.header, ring, ring.width);
        let proj = RingProjection::new(
            ring.inc,
            ring.pa,
            ring.xpos,
            ring.ypos,
            self.header.pixscale,
        );
        let (r_lo, r_hi) = ring.bounds();
        let nz = self.header.naxis[2];

        let (gx, gy, _) = self.cube.dims();
        for rx in 0..region.nx {
            for ry in 0..region.ny {
                let xi = rx as isize + region.x0;
                let yi = ry as isize + region.y0;
                if xi < 0 || yi < 0 || xi as usize >= gx || yi as usize >= gy {
                    continue;
                }
                let (x, y) = (xi as usize, yi as usize);
                let (radius, theta) = proj.from_pixel(x as f64, y as f64);
                if radius < r_lo || radius > r_hi || !self.side.admits(theta) {
                    continue;
                }
                for z in 0..nz {
                    if self.mask[[x, y, z]] && self.cube.get(x, y, z).is_finite() {
                        return true;
                    }
                }
            }
        }
        false
    }
}
