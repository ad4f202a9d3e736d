//! Per-ring tilted-ring fitting.
//!
//! Each ring is fitted independently: a downhill simplex explores the
//! user-selected free parameters against the masked residual between the
//! observation and a single-ring synthetic cube. Rings are scheduled across
//! the rayon pool with the inner synthesis kept sequential, so the outer
//! fit never double-books cores. An optional second pass regularises the
//! geometric parameters' radial profiles and refits the kinematics against
//! the frozen geometry.

pub mod regularise;
pub mod residual;

pub use residual::{build_mask, FType, MaskError, MaskKind, ResidualEvaluator, Side, WFunc};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use galmod::GalmodOptions;
use shared::algo::simplex::{self, SimplexOptions};
use shared::cancel::CancelToken;
use shared::cube::Cube;
use shared::header::Header;
use shared::progress::Progress;
use shared::rings::{FitParam, Ring, RingSet};
use shared::stats::{self, StatsError};

#[derive(Debug, Clone)]
pub struct GalfitOptions {
    /// Parameters the simplex may vary; the rest stay clamped to the ring
    /// set values.
    pub free: Vec<FitParam>,
    pub ftype: FType,
    pub wfunc: WFunc,
    pub side: Side,
    pub mask: MaskKind,
    /// Fractional tolerance of the simplex stop test.
    pub tol: f64,
    /// Report per-parameter uncertainties from the final simplex spread.
    pub flag_errors: bool,
    /// Run the regularising second pass.
    pub two_stage: bool,
    /// Polynomial degree for the second pass; -1 selects Bézier smoothing.
    pub polyn: i32,
    /// Options for the inner cube synthesis.
    pub galmod: GalmodOptions,
}

impl Default for GalfitOptions {
    fn default() -> Self {
        GalfitOptions {
            free: vec![FitParam::VRot, FitParam::VDisp],
            ftype: FType::Chi2,
            wfunc: WFunc::AbsCos,
            side: Side::Both,
            mask: MaskKind::Smoothing {
                factor: 2.0,
                snr_cut: 3.0,
            },
            tol: 1.0e-3,
            flag_errors: false,
            two_stage: false,
            polyn: -1,
            galmod: GalmodOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingStatus {
    Ok,
    /// Simplex hit the evaluation cap; parameters are the best vertex
    /// reached.
    NotConverged,
    /// No unmasked voxels in the ring's annulus; ring left untouched.
    NoData,
    /// Run was cancelled before this ring was fitted.
    Cancelled,
}

/// Result of a fit: the updated ring set, per-ring flags, and per-ring
/// parameter uncertainties when requested.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub rings: RingSet,
    pub status: Vec<RingStatus>,
    /// One entry per ring, one value per free parameter.
    pub errors: Option<Vec<Vec<f64>>>,
    pub cancelled: bool,
}

impl FitOutcome {
    pub fn any_not_converged(&self) -> bool {
        self.status.iter().any(|s| *s == RingStatus::NotConverged)
    }
}

#[derive(Error, Debug)]
pub enum GalfitError {
    #[error("no free parameters selected")]
    NoFreeParameters,
    #[error(transparent)]
    Mask(#[from] MaskError),
    #[error("cube statistics failed: {0}")]
    Stats(#[from] StatsError),
}

struct RingFit {
    ring: Ring,
    status: RingStatus,
    errors: Vec<f64>,
    cancelled: bool,
}

/// Fit the ring set against the observation.
pub fn fit(
    cube: &Cube,
    header: &Header,
    init: &RingSet,
    options: &GalfitOptions,
    cancel: Option<&CancelToken>,
    progress: &Progress,
) -> Result<FitOutcome, GalfitError> {
    if options.free.is_empty() {
        return Err(GalfitError::NoFreeParameters);
    }

    let mask = build_mask(cube, header, &options.mask)?;
    let cube_stats = stats::compute(cube.as_slice(), None)?;
    let noise_sigma = if cube_stats.sigma_robust() > 0.0 {
        cube_stats.sigma_robust()
    } else {
        1.0
    };

    // The inner synthesis must stay sequential: rings own the parallelism.
    let mut inner = options.galmod;
    inner.parallel = false;
    inner.norm = galmod::Normalisation::None;

    let evaluator = ResidualEvaluator {
        cube,
        header,
        mask: &mask,
        noise_sigma,
        ftype: options.ftype,
        wfunc: options.wfunc,
        side: options.side,
        galmod: inner,
    };

    info!(
        rings = init.len(),
        free = options.free.len(),
        "first fitting pass"
    );
    let first: Vec<RingFit> = (0..init.len())
        .into_par_iter()
        .map(|i| {
            let out = fit_ring(&evaluator, init, i, &options.free, options.tol, cancel);
            progress.inc();
            out
        })
        .collect();

    let mut rings: Vec<Ring> = first.iter().map(|f| f.ring).collect();
    let mut status: Vec<RingStatus> = first.iter().map(|f| f.status).collect();
    let mut errors: Vec<Vec<f64>> = first.into_iter().map(|f| f.errors).collect();
    let mut cancelled = status.iter().any(|s| *s == RingStatus::Cancelled);

    if options.two_stage && !cancelled {
        let (geo, kin): (Vec<FitParam>, Vec<FitParam>) = options
            .free
            .iter()
            .copied()
            .partition(|p| p.is_geometric());

        second_pass(
            &evaluator,
            &mut rings,
            &mut status,
            &mut errors,
            &geo,
            &kin,
            options,
            cancel,
            progress,
        );
        cancelled = status.iter().any(|s| *s == RingStatus::Cancelled);
    }

    let rings = match RingSet::new(rings) {
        Ok(r) => r,
        Err(err) => {
            // Clamping keeps each ring valid and radii are never touched,
            // so this indicates an internal inconsistency.
            warn!(error = %err, "fitted rings failed validation, returning initial set");
            init.clone()
        }
    };

    Ok(FitOutcome {
        rings,
        status,
        errors: if options.flag_errors { Some(errors) } else { None },
        cancelled,
    })
}

fn perturbation(param: FitParam, value: f64) -> f64 {
    let frac = match param {
        FitParam::VRot | FitParam::VDisp | FitParam::VRad => 0.10,
        _ => 0.05,
    };
    (value.abs() * frac).max(1.0)
}

fn clamp_param(param: FitParam, value: f64, header: &Header) -> f64 {
    match param {
        FitParam::Inc => value.clamp(0.0, 90.0),
        FitParam::Pa => value.rem_euclid(360.0),
        FitParam::VDisp => value.max(0.1),
        FitParam::Z0 => value.max(0.0),
        FitParam::VRot => value.abs(),
        FitParam::XPos => value.clamp(0.0, header.naxis[0] as f64 - 1.0),
        FitParam::YPos => value.clamp(0.0, header.naxis[1] as f64 - 1.0),
        FitParam::VSys | FitParam::VRad => value,
    }
}

fn apply_params(base: &Ring, free: &[FitParam], values: &[f64], header: &Header) -> Ring {
    let mut ring = *base;
    for (param, &value) in free.iter().zip(values.iter()) {
        param.set(&mut ring, clamp_param(*param, value, header));
    }
    ring
}

fn fit_ring(
    evaluator: &ResidualEvaluator,
    init: &RingSet,
    index: usize,
    free: &[FitParam],
    tol: f64,
    cancel: Option<&CancelToken>,
) -> RingFit {
    let base = *init.get(index);
    if cancel.map_or(false, |t| t.is_cancelled()) {
        return RingFit {
            ring: base,
            status: RingStatus::Cancelled,
            errors: vec![0.0; free.len()],
            cancelled: true,
        };
    }
    if !evaluator.has_data(&base) {
        warn!(ring = index, radius = base.radius, "no data in ring, skipping");
        return RingFit {
            ring: base,
            status: RingStatus::NoData,
            errors: vec![0.0; free.len()],
            cancelled: false,
        };
    }

    let start: Vec<f64> = free.iter().map(|p| p.get(&base)).collect();
    let deltas: Vec<f64> = free
        .iter()
        .zip(start.iter())
        .map(|(p, &v)| perturbation(*p, v))
        .collect();
    let vertices = simplex::initial_vertices(&start, &deltas);

    let header = evaluator.header;
    let objective = |values: &[f64]| -> f64 {
        let candidate = apply_params(&base, free, values, header);
        evaluator.evaluate(&candidate, index)
    };

    let simplex_options = SimplexOptions {
        tol,
        ..SimplexOptions::default()
    };
    let outcome = match simplex::minimise(objective, vertices, &simplex_options, cancel) {
        Ok(o) => o,
        Err(err) => {
            warn!(ring = index, error = %err, "simplex setup failed");
            return RingFit {
                ring: base,
                status: RingStatus::NotConverged,
                errors: vec![0.0; free.len()],
                cancelled: false,
            };
        }
    };

    let ring = apply_params(&base, free, &outcome.point, header);
    let status = if outcome.cancelled {
        RingStatus::Cancelled
    } else if outcome.converged {
        RingStatus::Ok
    } else {
        warn!(
            ring = index,
            evals = outcome.evals,
            "simplex hit the evaluation cap, keeping best vertex"
        );
        RingStatus::NotConverged
    };

    RingFit {
        ring,
        status,
        errors: outcome.spread,
        cancelled: outcome.cancelled,
    }
}

/// Regularise the geometric free parameters and refit the kinematic ones
/// against the frozen geometry.
#[allow(clippy::too_many_arguments)]
fn second_pass(
    evaluator: &ResidualEvaluator,
    rings: &mut Vec<Ring>,
    status: &mut Vec<RingStatus>,
    errors: &mut Vec<Vec<f64>>,
    geo: &[FitParam],
    kin: &[FitParam],
    options: &GalfitOptions,
    cancel: Option<&CancelToken>,
    progress: &Progress,
) {
    let radii: Vec<f64> = rings.iter().map(|r| r.radius).collect();
    let trusted: Vec<bool> = status
        .iter()
        .map(|s| matches!(s, RingStatus::Ok | RingStatus::NotConverged))
        .collect();

    info!(
        geometric = geo.len(),
        kinematic = kin.len(),
        degree = options.polyn,
        "regularising second pass"
    );

    for &param in geo {
        let values: Vec<f64> = rings.iter().map(|r| param.get(r)).collect();
        match regularise::regularise_profile(&radii, &values, &trusted, options.polyn) {
            Ok(smooth) => {
                for (ring, &value) in rings.iter_mut().zip(smooth.iter()) {
                    param.set(ring, clamp_param(param, value, evaluator.header));
                }
            }
            Err(err) => {
                warn!(param = param.name(), error = %err, "profile smoothing failed");
            }
        }
    }

    if kin.is_empty() {
        return;
    }

    // Refit the kinematics ring by ring with the regularised geometry held
    // fixed. Degenerate rings take neighbour-interpolated kinematics.
    let regularised = match RingSet::new(rings.clone()) {
        Ok(r) => r,
        Err(err) => {
            warn!(error = %err, "regularised rings failed validation, skipping kinematic refit");
            return;
        }
    };
    let refits: Vec<RingFit> = (0..regularised.len())
        .into_par_iter()
        .map(|i| {
            let out = fit_ring(evaluator, &regularised, i, kin, options.tol, cancel);
            progress.inc();
            out
        })
        .collect();

    for (i, refit) in refits.into_iter().enumerate() {
        match refit.status {
            RingStatus::NoData => {
                status[i] = RingStatus::NoData;
            }
            s => {
                rings[i] = refit.ring;
                status[i] = s;
                errors[i] = refit.errors;
            }
        }
    }

    // Interpolate kinematics into rings that still have no data of their
    // own.
    let trusted: Vec<bool> = status.iter().map(|s| *s == RingStatus::Ok).collect();
    for &param in kin {
        let values: Vec<f64> = rings.iter().map(|r| param.get(r)).collect();
        for i in 0..rings.len() {
            if status[i] == RingStatus::NoData {
                if let Some(v) =
                    regularise::interpolate_at(&radii, &values, &trusted, radii[i])
                {
                    param.set(&mut rings[i], clamp_param(param, v, evaluator.header));
                }
            }
        }
    }
}
