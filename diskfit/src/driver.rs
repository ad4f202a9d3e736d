//! Pipeline orchestration: load, detect, guess, fit, persist.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use finder::{IncAlgorithm, PaAlgorithm, ParamGuess, SearchOptions};
use galfit::{FitOutcome, GalfitOptions, RingStatus};
use galmod::GalmodOptions;
use ndarray::Array3;
use shared::beam::FWHM_TO_SIGMA;
use shared::cancel::CancelToken;
use shared::cube::Cube;
use shared::geometry;
use shared::header::Header;
use shared::progress::Progress;
use shared::rings::{FitParam, Ring, RingSet};
use shared::stats::ThresholdSpec;

use crate::fits::{self, FitsError};
use crate::params::{Params, RingValue};
use crate::ringio::{self, RingIoError};

#[derive(Error, Debug)]
pub enum DriverError {
    /// Invalid parameter or missing input; the run aborts immediately.
    #[error("user error: {0}")]
    User(String),
    /// The data cannot support the requested run (blank cube, no
    /// detection, unknown beam).
    #[error("data error: {0}")]
    Data(String),
    #[error(transparent)]
    Fits(#[from] FitsError),
    #[error(transparent)]
    RingIo(#[from] RingIoError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// CLI exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::User(_) | DriverError::Data(_) | DriverError::Internal(_) => 1,
            DriverError::Fits(_) | DriverError::Io { .. } | DriverError::RingIo(_) => 3,
            DriverError::Cancelled => 130,
        }
    }
}

/// What a completed run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub rings_file: PathBuf,
    pub model_file: PathBuf,
    pub residual_file: PathBuf,
    pub not_converged: usize,
    pub skipped: usize,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> DriverError + '_ {
    move |source| DriverError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Execute a full run described by `params`.
pub fn run(params: &Params, cancel: &CancelToken) -> Result<RunSummary, DriverError> {
    let fitsfile = params
        .fitsfile
        .as_ref()
        .ok_or_else(|| DriverError::User("no FITSFILE given".into()))?;

    let (cube, header) = fits::load_cube(fitsfile)?;
    header
        .validate()
        .map_err(|e| DriverError::Data(e.to_string()))?;
    if !cube.as_slice().iter().any(|v| v.is_finite()) {
        return Err(DriverError::Data("cube contains only blank voxels".into()));
    }
    info!(
        file = %fitsfile.display(),
        nx = header.naxis[0],
        ny = header.naxis[1],
        nz = header.naxis[2],
        "cube loaded"
    );

    if params.threads > 0 {
        // The pool can only be sized once per process; later runs in the
        // same process keep the first size.
        if rayon::ThreadPoolBuilder::new()
            .num_threads(params.threads)
            .build_global()
            .is_err()
        {
            warn!("thread pool already initialised, THREADS ignored");
        }
    }

    let init = initial_rings(&cube, &header, params, cancel)?;
    info!(rings = init.len(), "initial ring set ready");

    let galmod_options = GalmodOptions {
        cdens: params.cdens,
        nv: params.nv,
        ltype: params.ltype,
        // Instrumental broadening of one channel, in quadrature with the
        // ring dispersion.
        sigma_instr: geometry::channel_width_kms(&header) / FWHM_TO_SIGMA,
        norm: galmod::Normalisation::None,
        smooth: true,
        seed: 1,
        parallel: true,
    };
    let fit_options = GalfitOptions {
        free: params.free.clone(),
        ftype: params.ftype,
        wfunc: params.wfunc,
        side: params.side,
        mask: params.mask.to_mask_kind(params.threshold),
        tol: params.tol,
        flag_errors: params.flag_errors,
        two_stage: params.two_stage,
        polyn: params.polyn,
        galmod: galmod_options,
    };

    let passes = if params.two_stage { 2 } else { 1 };
    let progress = Progress::new((init.len() * passes) as u64, "fitting");
    let outcome = galfit::fit(&cube, &header, &init, &fit_options, Some(cancel), &progress)
        .map_err(|e| DriverError::Data(e.to_string()))?;
    progress.finish();

    let summary = persist(params, &cube, &header, &outcome, &galmod_options)?;
    if outcome.cancelled {
        warn!("cancelled; partial results written to {}", params.outfolder.display());
        return Err(DriverError::Cancelled);
    }
    Ok(summary)
}

/// Build the starting ring set: user-supplied geometry where given, source
/// finding plus parameter guessing for whatever is left on auto.
fn initial_rings(
    cube: &Cube,
    header: &Header,
    params: &Params,
    cancel: &CancelToken,
) -> Result<RingSet, DriverError> {
    let needs_guess = params.xpos.is_auto()
        || params.ypos.is_auto()
        || params.vsys.is_auto()
        || params.inc.is_auto()
        || params.pa.is_auto()
        || params.vrot.is_auto()
        || params.nradii.is_none()
        || params.radsep.is_none();

    let guessed = if needs_guess {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        let search_options = SearchOptions {
            primary: ThresholdSpec::Snr(params.snr_cut),
            secondary: ThresholdSpec::Snr(params.growth_cut),
            grow: true,
            ..SearchOptions::default()
        };
        let detections = finder::search(cube, header, &search_options)
            .map_err(|e| DriverError::Data(e.to_string()))?;
        let detection = detections
            .first()
            .ok_or_else(|| DriverError::Data("no source detected in the cube".into()))?;
        info!(
            voxels = detection.voxel_count,
            flux = detection.total_flux,
            "brightest detection selected"
        );

        let mut guess = ParamGuess::new(cube, header, detection)
            .map_err(|e| DriverError::Data(e.to_string()))?;
        guess
            .estimate_all(
                PaAlgorithm::MedianDeviation,
                if header.beam.is_known() {
                    IncAlgorithm::EllipseFit
                } else {
                    IncAlgorithm::AxisRatio
                },
            )
            .map_err(|e| DriverError::Data(e.to_string()))?;
        Some(guess.to_rings().map_err(|e| DriverError::Internal(e.to_string()))?)
    } else {
        None
    };

    // Ring layout: explicit NRADII/RADSEP override the guessed layout.
    let (nradii, radsep) = match (params.nradii, params.radsep) {
        (Some(n), Some(s)) => (n, s),
        _ => {
            let g = guessed
                .as_ref()
                .ok_or_else(|| DriverError::User("NRADII and RADSEP must both be given when the finder is disabled".into()))?;
            (
                params.nradii.unwrap_or(g.len()),
                params.radsep.unwrap_or(g.get(0).width),
            )
        }
    };
    if nradii == 0 || radsep <= 0.0 {
        return Err(DriverError::User(format!(
            "invalid ring layout: NRADII={nradii}, RADSEP={radsep}"
        )));
    }

    let fallback = |value: &RingValue, from_guess: Option<f64>, name: &str| -> Result<Vec<f64>, DriverError> {
        resolve_ring_value(value, from_guess, name, nradii)
    };
    let g = guessed.as_ref();
    let xpos = fallback(&params.xpos, g.map(|r| r.get(0).xpos), "XPOS")?;
    let ypos = fallback(&params.ypos, g.map(|r| r.get(0).ypos), "YPOS")?;
    let vsys = fallback(&params.vsys, g.map(|r| r.get(0).vsys), "VSYS")?;
    let vrot = fallback(&params.vrot, g.map(|r| r.get(0).vrot), "VROT")?;
    let vdisp = fallback(&params.vdisp, Some(8.0), "VDISP")?;
    let vrad = fallback(&params.vrad, Some(0.0), "VRAD")?;
    let inc = fallback(&params.inc, g.map(|r| r.get(0).inc), "INC")?;
    let pa = fallback(&params.pa, g.map(|r| r.get(0).pa), "PA")?;
    let z0 = fallback(&params.z0, Some(0.0), "Z0")?;
    let dens = fallback(&params.dens, Some(1.0e20), "DENS")?;

    let rings: Vec<Ring> = (0..nradii)
        .map(|i| Ring {
            radius: (i as f64 + 0.5) * radsep,
            width: radsep,
            xpos: xpos[i],
            ypos: ypos[i],
            vsys: vsys[i],
            vrot: vrot[i],
            vdisp: vdisp[i],
            vrad: vrad[i],
            inc: inc[i],
            pa: pa[i].rem_euclid(360.0),
            z0: z0[i],
            dens: dens[i],
        })
        .collect();
    RingSet::new(rings).map_err(|e| DriverError::User(e.to_string()))
}

/// Expand one ring parameter to a per-ring vector from a fixed value, a
/// profile file, or the guessed estimate.
fn resolve_ring_value(
    value: &RingValue,
    from_guess: Option<f64>,
    name: &str,
    nradii: usize,
) -> Result<Vec<f64>, DriverError> {
    match value {
        RingValue::Value(v) => Ok(vec![*v; nradii]),
        RingValue::File(path) => {
            let profile = ringio::read_profile(path)?;
            if profile.len() != nradii {
                return Err(DriverError::User(format!(
                    "{name} profile {} has {} values for {} rings",
                    path.display(),
                    profile.len(),
                    nradii
                )));
            }
            Ok(profile)
        }
        RingValue::Auto => from_guess.map(|v| vec![v; nradii]).ok_or_else(|| {
            DriverError::Internal(format!("{name} left on auto without an estimate"))
        }),
    }
}

/// Write every persisted output and the run log.
fn persist(
    params: &Params,
    cube: &Cube,
    header: &Header,
    outcome: &FitOutcome,
    galmod_options: &GalmodOptions,
) -> Result<RunSummary, DriverError> {
    let out = &params.outfolder;
    std::fs::create_dir_all(out).map_err(io_err(out))?;

    let rings_file = out.join("rings_final.txt");
    ringio::write_rings(&rings_file, &outcome.rings)?;
    if let Some(errors) = &outcome.errors {
        ringio::write_ring_errors(
            &out.join("rings_final_err.txt"),
            &outcome.rings,
            &params.free,
            errors,
        )?;
    }

    // Final model cube with the requested normalisation, and the residual.
    let mut model_options = *galmod_options;
    model_options.norm = params.norm;
    let reference = cube.moment0();
    let model = galmod::synthesise(header, &outcome.rings, &model_options, Some(&reference), None)
        .map_err(|e| DriverError::Data(e.to_string()))?;

    let mut residual = Array3::<f64>::zeros(cube.dims());
    for ((x, y, z), r) in residual.indexed_iter_mut() {
        let o = cube.get(x, y, z);
        *r = if o.is_finite() {
            o - model[[x, y, z]]
        } else {
            f64::NAN
        };
    }

    let model_file = out.join("model_cube.fits");
    fits::write_cube(&model_file, &model, header)?;
    let residual_file = out.join("residual_cube.fits");
    fits::write_cube(&residual_file, &residual, header)?;

    let not_converged = outcome
        .status
        .iter()
        .filter(|s| **s == RingStatus::NotConverged)
        .count();
    let skipped = outcome
        .status
        .iter()
        .filter(|s| **s == RingStatus::NoData)
        .count();

    let log_file = out.join("diskfit.log");
    let mut log = String::new();
    log.push_str("diskfit run summary\n");
    log.push_str(&format!("free parameters: {}\n", join_params(&params.free)));
    log.push_str(&format!(
        "rings: {} ({} not converged, {} without data)\n",
        outcome.rings.len(),
        not_converged,
        skipped
    ));
    for (i, (ring, status)) in outcome.rings.iter().zip(outcome.status.iter()).enumerate() {
        log.push_str(&format!(
            "ring {:>3}  r={:>8.2}  vrot={:>8.2}  vdisp={:>7.2}  inc={:>6.2}  pa={:>7.2}  [{:?}]\n",
            i + 1,
            ring.radius,
            ring.vrot,
            ring.vdisp,
            ring.inc,
            ring.pa,
            status
        ));
    }
    std::fs::write(&log_file, log).map_err(io_err(&log_file))?;

    info!(
        rings = %rings_file.display(),
        model = %model_file.display(),
        "outputs written"
    );

    Ok(RunSummary {
        rings_file,
        model_file,
        residual_file,
        not_converged,
        skipped,
    })
}

fn join_params(params: &[FitParam]) -> String {
    params
        .iter()
        .map(|p| p.name())
        .collect::<Vec<_>>()
        .join(" ")
}
