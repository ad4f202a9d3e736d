//! First-guess ring geometry from a detection.
//!
//! Derives everything the fitter needs to start: centre, systemic velocity,
//! kinematic position angle, inclination, maximum radius, ring spacing and
//! a rotation velocity, all from the detection's intensity and
//! velocity-field maps. The position angle comes from a 0.5-degree scan
//! maximising the median |V - vsys| along the candidate axis; the
//! inclination from the major/minor axis lengths, optionally refined by a
//! two-parameter downhill simplex against either an ellipse-coverage count
//! or a model intensity map.

use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, warn};

use galmod::{GalmodError, GalmodOptions, Ltype, Normalisation};
use shared::algo::simplex::{self, SimplexError, SimplexOptions};
use shared::cube::Cube;
use shared::geometry::{self, RingProjection, DEG2RAD};
use shared::header::Header;
use shared::rings::{Ring, RingSet};
use shared::stats;

use crate::object3d::Detection;

/// Position-angle estimator to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaAlgorithm {
    /// Scan candidate angles, maximising the median |V - vsys| along the
    /// line through the centre.
    MedianDeviation,
    /// Locate the beam-sized regions of highest and lowest median velocity
    /// and regress a line through them. Whether the centre joins the
    /// regression as a third point is configurable.
    VelocityExtremes { include_centre: bool },
}

/// Inclination estimator to use after the axis-ratio first guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncAlgorithm {
    /// Keep acos(axmin/axmaj) from the axis lengths.
    AxisRatio,
    /// Simplex over (Rmax, inc) maximising valid-pixel coverage of the
    /// projected ellipse.
    EllipseFit,
    /// Simplex over (Rmax, inc) minimising |I_obs - I_model| with model
    /// maps from the cube synthesiser.
    ModelMap,
}

#[derive(Error, Debug)]
pub enum GuessError {
    #[error("detection has no voxels")]
    EmptyDetection,
    #[error("no valid velocity-field samples along the candidate axes")]
    NoAxisSamples,
    #[error("axis lengths are degenerate, cannot derive an inclination")]
    DegenerateAxes,
    #[error("inclination refinement did not converge")]
    RefinementFailed(#[from] SimplexError),
    #[error(transparent)]
    Galmod(#[from] GalmodError),
}

/// Initial-parameter estimation workspace for one detection.
pub struct ParamGuess<'a> {
    header: &'a Header,
    detection: &'a Detection,

    /// Intensity map of the detection (sum of its voxels per pixel).
    pub intmap: Array2<f64>,
    /// Flux-weighted velocity field of the detection, NaN outside it.
    pub vfield: Array2<f64>,

    pub xcentre: f64,
    pub ycentre: f64,
    pub vsystem: f64,
    pub posang: f64,
    pub inclin: f64,
    /// Maximum radius in arcsec.
    pub rmax: f64,
    /// Ring separation in arcsec.
    pub radsep: f64,
    pub nrings: usize,
    pub vrot: f64,

    total_flux: f64,
    /// Slope/intercept of the major-axis line in pixel coordinates.
    pmaj: [f64; 2],
    pmin: [f64; 2],
}

impl<'a> ParamGuess<'a> {
    pub fn new(
        cube: &'a Cube,
        header: &'a Header,
        detection: &'a Detection,
    ) -> Result<ParamGuess<'a>, GuessError> {
        if detection.voxel_count == 0 {
            return Err(GuessError::EmptyDetection);
        }
        let (nx, ny, _) = cube.dims();
        let mut fluxsum = Array2::<f64>::zeros((nx, ny));
        let mut fluxvel = Array2::<f64>::zeros((nx, ny));
        for (x, y, z) in detection.voxels() {
            let f = cube.get(x, y, z);
            if f.is_finite() {
                fluxsum[[x, y]] += f;
                fluxvel[[x, y]] += f * geometry::velocity_of(header, z as f64);
            }
        }
        let mut vfield = Array2::from_elem((nx, ny), f64::NAN);
        for ((x, y), &w) in fluxsum.indexed_iter() {
            if w > 0.0 {
                vfield[[x, y]] = fluxvel[[x, y]] / w;
            }
        }
        let total_flux = fluxsum.iter().sum();

        Ok(ParamGuess {
            header,
            detection,
            intmap: fluxsum,
            vfield,
            xcentre: 0.0,
            ycentre: 0.0,
            vsystem: 0.0,
            posang: 0.0,
            inclin: 0.0,
            rmax: 0.0,
            // Ring separation starts at the beam size.
            radsep: header.beam.bmaj.max(header.pixscale),
            nrings: 0,
            vrot: 0.0,
            total_flux,
            pmaj: [0.0; 2],
            pmin: [0.0; 2],
        })
    }

    /// Run every estimator in dependency order.
    pub fn estimate_all(
        &mut self,
        pa_algorithm: PaAlgorithm,
        inc_algorithm: IncAlgorithm,
    ) -> Result<(), GuessError> {
        self.find_centre();
        self.find_systemic_velocity();
        self.find_position_angle(pa_algorithm)?;
        self.find_inclination(inc_algorithm)?;
        self.find_rings();
        self.find_rotation_velocity();
        debug!(
            x = self.xcentre,
            y = self.ycentre,
            vsys = self.vsystem,
            pa = self.posang,
            inc = self.inclin,
            rmax = self.rmax,
            nrings = self.nrings,
            "initial guesses"
        );
        Ok(())
    }

    /// Centre: average of the flux-weighted and geometric centroids.
    pub fn find_centre(&mut self) {
        self.xcentre = 0.5 * (self.detection.x_centroid + self.detection.x_average);
        self.ycentre = 0.5 * (self.detection.y_centroid + self.detection.y_average);
    }

    /// Systemic velocity: first moment of the detection's integrated
    /// spectrum.
    pub fn find_systemic_velocity(&mut self) {
        self.vsystem = self.detection.vsys;
    }

    /// Rotation velocity from the line width: vrot = (W50/2) / sin(inc).
    pub fn find_rotation_velocity(&mut self) {
        // Face-on guard: below one degree of inclination the deprojection
        // diverges.
        let sin_inc = (self.inclin * DEG2RAD).sin().max((1.0 * DEG2RAD).sin());
        self.vrot = (self.detection.w50 / 2.0).abs() / sin_inc;
    }

    /// Ring spacing from the beam; halve once if it gives fewer than five
    /// rings.
    pub fn find_rings(&mut self) {
        let mut n = (self.rmax / self.radsep).round() as i64;
        if n < 5 {
            self.radsep /= 2.0;
            n = (self.rmax / self.radsep).round() as i64;
        }
        self.nrings = n.max(1) as usize;
    }

    pub fn find_position_angle(&mut self, algorithm: PaAlgorithm) -> Result<(), GuessError> {
        let (velmin, velmax) = self.velocity_range();
        let best = match algorithm {
            PaAlgorithm::MedianDeviation => self.pa_median_deviation(velmin, velmax)?,
            PaAlgorithm::VelocityExtremes { include_centre } => {
                self.pa_velocity_extremes(velmin, velmax, include_centre)?
            }
        };
        self.posang = best;
        self.set_axes_lines();
        Ok(())
    }

    fn velocity_range(&self) -> (f64, f64) {
        let nz = self.header.naxis[2];
        let a = geometry::velocity_of(self.header, 0.0);
        let b = geometry::velocity_of(self.header, nz as f64 - 1.0);
        (a.min(b), a.max(b))
    }

    fn vfield_at(&self, x: i64, y: i64) -> f64 {
        let (nx, ny) = self.vfield.dim();
        if x < 0 || y < 0 || x as usize >= nx || y as usize >= ny {
            return f64::NAN;
        }
        self.vfield[[x as usize, y as usize]]
    }

    /// Scan candidate angles in 0.5-degree steps; the angle maximising the
    /// median |V - vsys| along the line through the centre is the
    /// kinematic major axis. The 180-degree ambiguity is broken by which
    /// side of the centre carries the receding velocities.
    fn pa_median_deviation(&self, velmin: f64, velmax: f64) -> Result<f64, GuessError> {
        let (xmin, xmax) = (self.detection.xmin as i64, self.detection.xmax as i64);
        let (ymin, ymax) = (self.detection.ymin as i64, self.detection.ymax as i64);

        let mut maxdev = 0.0;
        let mut best_pa = f64::NAN;
        let (mut vl, mut vr) = (0.0, 0.0);

        let mut p = 0.0;
        while p < 180.0 {
            let mut vdev: Vec<f64> = Vec::new();
            let mut sumleft = 0.0;
            let mut sumright = 0.0;

            if p > 45.0 && p < 135.0 {
                // Steep lines sample better along y.
                for y in ymin..=ymax {
                    let x = if p == 90.0 {
                        self.xcentre.round() as i64
                    } else {
                        ((y as f64 - self.ycentre) / (p * DEG2RAD).tan() + self.xcentre).round()
                            as i64
                    };
                    let v = self.vfield_at(x, y);
                    let ok = x >= xmin && x <= xmax && v.is_finite() && v >= velmin && v <= velmax;
                    if !ok {
                        continue;
                    }
                    vdev.push((v - self.vsystem).abs());
                    if p == 90.0 {
                        if y as f64 > self.ycentre {
                            sumleft += v - self.vsystem;
                        } else {
                            sumright += v - self.vsystem;
                        }
                    } else if (x as f64) < self.xcentre {
                        sumleft += v - self.vsystem;
                    } else {
                        sumright += v - self.vsystem;
                    }
                }
            } else {
                for x in xmin..=xmax {
                    let y = ((p * DEG2RAD).tan() * (x as f64 - self.xcentre) + self.ycentre)
                        .round() as i64;
                    let v = self.vfield_at(x, y);
                    let ok = y >= ymin && y <= ymax && v.is_finite() && v >= velmin && v <= velmax;
                    if !ok {
                        continue;
                    }
                    vdev.push((v - self.vsystem).abs());
                    if (x as f64) < self.xcentre {
                        sumleft += v - self.vsystem;
                    } else {
                        sumright += v - self.vsystem;
                    }
                }
            }

            if !vdev.is_empty() {
                let median = stats::median(&vdev, None).unwrap_or(f64::NAN);
                if median.is_finite() && median > maxdev && median.abs() < 1.0e16 {
                    maxdev = median;
                    best_pa = p;
                    vl = sumleft;
                    vr = sumright;
                }
            }
            p += 0.5;
        }

        if !best_pa.is_finite() {
            return Err(GuessError::NoAxisSamples);
        }

        // Orient the angle so the receding side lies along +PA.
        let posang = if vl < vr {
            if best_pa < 90.0 {
                270.0 + best_pa
            } else {
                90.0 + best_pa
            }
        } else if best_pa < 90.0 {
            90.0 + best_pa
        } else {
            best_pa - 90.0
        };
        Ok(posang % 360.0)
    }

    /// Locate the beam-sized windows of extreme median velocity and regress
    /// the axis through them (optionally through the centre as well).
    fn pa_velocity_extremes(
        &self,
        velmin: f64,
        velmax: f64,
        include_centre: bool,
    ) -> Result<f64, GuessError> {
        let range = (self.header.beam.bmaj / self.header.pixscale).ceil().max(1.0) as i64;
        let (xmin, ymin) = (self.detection.xmin as i64, self.detection.ymin as i64);
        let xsize = (self.detection.xmax - self.detection.xmin + 1) as i64;
        let ysize = (self.detection.ymax - self.detection.ymin + 1) as i64;

        let mut vel_high = self.vsystem;
        let mut vel_low = self.vsystem;
        let mut coord_high = (0i64, 0i64);
        let mut coord_low = (0i64, 0i64);

        for y in range..ysize - range {
            for x in range..xsize - range {
                if !self.vfield_at(x + xmin, y + ymin).is_finite() {
                    continue;
                }
                let mut window = Vec::new();
                for yi in y - range..=y + range {
                    for xi in x - range..=x + range {
                        let v = self.vfield_at(xi + xmin, yi + ymin);
                        if v.is_finite() {
                            window.push(v);
                        }
                    }
                }
                if window.is_empty() {
                    continue;
                }
                let median = match stats::median(&window, None) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if median < vel_low && median >= velmin {
                    vel_low = median;
                    coord_low = (x + xmin, y + ymin);
                }
                if median > vel_high && median <= velmax {
                    vel_high = median;
                    coord_high = (x + xmin, y + ymin);
                }
            }
        }

        if coord_high == coord_low {
            return Err(GuessError::NoAxisSamples);
        }

        let mut xs = vec![coord_low.0 as f64, coord_high.0 as f64];
        let mut ys = vec![coord_low.1 as f64, coord_high.1 as f64];
        if include_centre {
            xs.push(self.xcentre.round());
            ys.push(self.ycentre.round());
        }
        let slope = regress_slope(&xs, &ys).ok_or(GuessError::NoAxisSamples)?;

        let ang = slope.atan();
        let posang = if coord_high.0 as f64 >= self.xcentre {
            270.0 + ang / DEG2RAD
        } else {
            90.0 + ang / DEG2RAD
        };
        Ok(posang % 360.0)
    }

    /// Slope/intercept of the major- and minor-axis lines through the
    /// centre for the current position angle.
    fn set_axes_lines(&mut self) {
        let mut m = self.posang - 90.0;
        while m > 180.0 {
            m -= 180.0;
        }
        while m < 0.0 {
            m += 180.0;
        }
        self.pmaj[0] = (m * DEG2RAD).tan();
        self.pmaj[1] = self.ycentre - self.pmaj[0] * self.xcentre;
        self.pmin[0] = -1.0 / self.pmaj[0];
        self.pmin[1] = self.ycentre - self.pmin[0] * self.xcentre;
    }

    /// Half-length of the galaxy along the line `y = m x + b`, as the mean
    /// of the two farthest valid velocity-field pixels either side of the
    /// centre.
    fn axis_length(&self, lpar: [f64; 2]) -> f64 {
        let (xmin, xmax) = (self.detection.xmin as i64, self.detection.xmax as i64);
        let (ymin, ymax) = (self.detection.ymin as i64, self.detection.ymax as i64);

        let mut r_left: f64 = 0.0;
        let mut r_right: f64 = 0.0;

        let mut p = lpar[0].atan() / DEG2RAD;
        if p < 0.0 {
            p += 180.0;
        }

        if p > 45.0 && p < 135.0 {
            for y in ymin..=ymax {
                let x = if (p - 90.0).abs() < 1.0e-9 {
                    self.xcentre.round() as i64
                } else {
                    ((y as f64 - lpar[1]) / lpar[0]).round() as i64
                };
                let v = self.vfield_at(x, y);
                if !(x >= xmin && x <= xmax && v.is_finite()) {
                    continue;
                }
                let r = ((x as f64 - self.xcentre).powi(2) + (y as f64 - self.ycentre).powi(2))
                    .sqrt();
                let left = if (p - 90.0).abs() < 1.0e-9 {
                    (y as f64) <= self.ycentre
                } else {
                    (x as f64) <= self.xcentre
                };
                if left {
                    r_left = r_left.max(r);
                } else {
                    r_right = r_right.max(r);
                }
            }
        } else {
            for x in xmin..=xmax {
                let y = (lpar[0] * x as f64 + lpar[1]).round() as i64;
                let v = self.vfield_at(x, y);
                if !(y >= ymin && y <= ymax && v.is_finite()) {
                    continue;
                }
                let r = ((x as f64 - self.xcentre).powi(2) + (y as f64 - self.ycentre).powi(2))
                    .sqrt();
                if (x as f64) <= self.xcentre {
                    r_left = r_left.max(r);
                } else {
                    r_right = r_right.max(r);
                }
            }
        }
        0.5 * (r_left + r_right)
    }

    pub fn find_inclination(&mut self, algorithm: IncAlgorithm) -> Result<(), GuessError> {
        // The axis-ratio estimate always runs first; it seeds the simplex
        // refinements.
        let mut axmaj = self.axis_length(self.pmaj);
        let mut axmin = self.axis_length(self.pmin);

        if axmin > axmaj {
            warn!(
                axmaj,
                axmin,
                "major axis shorter than minor axis, swapping; the galaxy is \
                 less elongated along the kinematic axis"
            );
            std::mem::swap(&mut axmin, &mut axmaj);
        }
        if axmaj <= 0.0 {
            return Err(GuessError::DegenerateAxes);
        }

        self.inclin = (axmin / axmaj).clamp(0.0, 1.0).acos() / DEG2RAD;
        self.rmax = axmaj * self.header.pixscale;

        match algorithm {
            IncAlgorithm::AxisRatio => Ok(()),
            IncAlgorithm::EllipseFit => self.refine_inclination(|s, pars| s.func_ellipse(pars)),
            IncAlgorithm::ModelMap => self.refine_inclination(|s, pars| s.func_model_map(pars)),
        }
    }

    fn refine_inclination<F>(&mut self, objective: F) -> Result<(), GuessError>
    where
        F: Fn(&ParamGuess<'a>, &[f64]) -> f64,
    {
        let start = [self.rmax, self.inclin];
        let deltas = [0.1 * self.rmax, 0.1 * self.inclin.max(1.0)];
        let vertices = simplex::initial_vertices(&start, &deltas);
        let outcome = simplex::minimise(
            |pars| objective(self, pars),
            vertices,
            &SimplexOptions::default(),
            None,
        )?;
        if outcome.converged {
            self.rmax = outcome.point[0];
            self.inclin = outcome.point[1].clamp(0.0, 90.0);
        } else {
            warn!("inclination refinement hit the evaluation cap, keeping axis-ratio estimate");
        }
        Ok(())
    }

    /// Ellipse-coverage objective: blank velocity-field pixels inside the
    /// projected ellipse count against, valid ones in favour.
    fn func_ellipse(&self, pars: &[f64]) -> f64 {
        let r_pix = pars[0] / self.header.pixscale;
        let inc = pars[1];
        if !(0.0..=90.0).contains(&inc) || r_pix <= 0.0 {
            return f64::INFINITY;
        }
        let (sin_pa, cos_pa) = (self.posang * DEG2RAD).sin_cos();
        let cos_inc = (inc * DEG2RAD).cos();

        let (nx, ny) = self.vfield.dim();
        let mut score = 0.0;
        for x in 0..nx {
            for y in 0..ny {
                let dx = x as f64 - self.xcentre;
                let dy = y as f64 - self.ycentre;
                let xr = -dx * sin_pa + dy * cos_pa;
                let yr = (-dx * cos_pa - dy * sin_pa) / cos_inc;
                if (xr * xr + yr * yr).sqrt() <= r_pix {
                    if self.vfield[[x, y]].is_finite() {
                        score -= 1.0;
                    } else {
                        score += 1.0;
                    }
                }
            }
        }
        score
    }

    /// Model-map objective: synthesise a flat-profile disk with the
    /// candidate (Rmax, inc), collapse it and compare against the observed
    /// intensity map.
    fn func_model_map(&self, pars: &[f64]) -> f64 {
        let radsep = self.radsep / 2.0;
        let rmax = if pars[0] < 0.0 {
            2.0 * self.radsep
        } else {
            pars[0].min(1.5 * self.rmax)
        };
        let inc = pars[1].clamp(1.0, 89.0);

        let nr = ((rmax / radsep) as usize).max(1);
        let radii: Vec<f64> = (0..nr).map(|i| (i as f64 + 0.5) * radsep).collect();

        // Radial profile of the observed intensity map under the candidate
        // geometry.
        let proj = RingProjection::new(inc, self.posang, self.xcentre, self.ycentre, self.header.pixscale);
        let mut prof = vec![0.0; nr];
        let mut count = vec![0usize; nr];
        for ((x, y), &v) in self.intmap.indexed_iter() {
            if !v.is_finite() {
                continue;
            }
            let (r, _) = proj.from_pixel(x as f64, y as f64);
            let i = (r / radsep) as usize;
            if i < nr {
                prof[i] += v.abs();
                count[i] += 1;
            }
        }
        for i in 0..nr {
            if count[i] > 0 {
                prof[i] /= count[i] as f64;
            }
        }

        // Normalise the profile to order unity so the synthesiser works far
        // from underflow, then scale to column-density units.
        let mut profmin = f64::MAX;
        for (&p, &c) in prof.iter().zip(count.iter()) {
            if c > 0 && p > 0.0 && p < profmin {
                profmin = p;
            }
        }
        if !profmin.is_finite() || profmin == f64::MAX {
            return f64::INFINITY;
        }
        let mut factor = 1.0;
        let mut pmin = profmin;
        while pmin < 0.1 {
            pmin *= 10.0;
            factor *= 10.0;
        }
        while pmin > 10.0 {
            pmin /= 10.0;
            factor /= 10.0;
        }

        let vrot_guess = 10.0 * geometry::channel_width_kms(self.header);
        let rings: Vec<Ring> = radii
            .iter()
            .enumerate()
            .map(|(i, &radius)| Ring {
                radius,
                width: radsep,
                xpos: self.xcentre,
                ypos: self.ycentre,
                vsys: self.vsystem,
                vrot: vrot_guess,
                vdisp: 5.0,
                vrad: 0.0,
                inc,
                pa: self.posang,
                z0: 0.0,
                dens: if prof[i] > 0.0 {
                    factor * prof[i] * 1.0e20
                } else {
                    pmin * 1.0e20
                },
            })
            .collect();
        let rings = match RingSet::new(rings) {
            Ok(r) => r,
            Err(_) => return f64::INFINITY,
        };

        let options = GalmodOptions {
            cdens: 1.0,
            nv: -1,
            ltype: Ltype::Gaussian,
            sigma_instr: 0.0,
            norm: Normalisation::None,
            smooth: true,
            seed: 5,
            parallel: false,
        };
        let model = match galmod::synthesise(self.header, &rings, &options, None, None) {
            Ok(m) => m,
            Err(_) => return f64::INFINITY,
        };

        let (nx, ny, nz) = model.dim();
        let mut model_map = Array2::<f64>::zeros((nx, ny));
        let mut total_model = 0.0;
        for x in 0..nx {
            for y in 0..ny {
                let s: f64 = (0..nz).map(|z| model[[x, y, z]]).sum();
                model_map[[x, y]] = s;
                total_model += s;
            }
        }
        if total_model <= 0.0 {
            return f64::INFINITY;
        }
        let scale = self.total_flux / total_model;

        let mut residual = 0.0;
        for ((x, y), &m) in model_map.indexed_iter() {
            let o = self.intmap[[x, y]];
            if o.is_finite() {
                residual += (o - m * scale).abs();
            }
        }
        residual
    }

    /// Build the initial ring set from the estimates.
    pub fn to_rings(&self) -> Result<RingSet, shared::rings::RingError> {
        let rings: Vec<Ring> = (0..self.nrings)
            .map(|i| Ring {
                radius: (i as f64 + 0.5) * self.radsep,
                width: self.radsep,
                xpos: self.xcentre,
                ypos: self.ycentre,
                vsys: self.vsystem,
                vrot: self.vrot,
                vdisp: 8.0,
                vrad: 0.0,
                inc: self.inclin.clamp(0.0, 90.0),
                pa: self.posang.rem_euclid(360.0),
                z0: 0.0,
                dens: 1.0e20,
            })
            .collect();
        RingSet::new(rings)
    }
}

/// Least-squares slope of y on x; None when x has no spread.
fn regress_slope(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let sxx: f64 = xs.iter().map(|x| (x - mx) * (x - mx)).sum();
    if sxx < 1.0e-12 {
        return None;
    }
    let sxy: f64 = xs.iter().zip(ys.iter()).map(|(x, y)| (x - mx) * (y - my)).sum();
    Some(sxy / sxx)
}
