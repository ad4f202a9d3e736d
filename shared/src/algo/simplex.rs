//! Downhill-simplex (Nelder–Mead) minimisation.
//!
//! The implementation follows the classic amoeba scheme: reflection,
//! expansion, one-dimensional contraction and whole-simplex shrinkage, with
//! the fractional tolerance test `2|f_hi - f_lo| / (|f_hi| + |f_lo| + TINY)`
//! and a hard cap on objective evaluations. Objectives may return
//! `f64::INFINITY` for out-of-domain points; such vertices are reflected
//! away from.

use crate::cancel::CancelToken;
use thiserror::Error;

const TINY: f64 = 1.0e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimplexError {
    #[error("a simplex over {ndim} dimensions needs one more vertex than dimensions, got {got}")]
    WrongVertexCount { ndim: usize, got: usize },
    #[error("simplex vertices must all have the same dimension")]
    RaggedVertices,
    #[error("simplex needs at least one dimension")]
    ZeroDimensional,
}

#[derive(Debug, Clone, Copy)]
pub struct SimplexOptions {
    /// Fractional convergence tolerance on the objective spread.
    pub tol: f64,
    /// Maximum number of objective evaluations.
    pub max_evals: usize,
}

impl Default for SimplexOptions {
    fn default() -> Self {
        SimplexOptions {
            tol: 1.0e-3,
            max_evals: 5000,
        }
    }
}

/// Result of a minimisation: the best vertex, convergence flags and the
/// per-dimension standard deviation of the final simplex (used as a crude
/// parameter uncertainty).
#[derive(Debug, Clone)]
pub struct SimplexOutcome {
    pub point: Vec<f64>,
    pub value: f64,
    pub converged: bool,
    pub cancelled: bool,
    pub evals: usize,
    pub spread: Vec<f64>,
}

/// Build the starting simplex around `start`: the base vertex is offset by
/// half a step in every dimension and each further vertex adds one full
/// step along its axis, so the simplex brackets the starting point.
pub fn initial_vertices(start: &[f64], deltas: &[f64]) -> Vec<Vec<f64>> {
    let ndim = start.len();
    let base: Vec<f64> = (0..ndim).map(|j| start[j] - 0.5 * deltas[j]).collect();
    let mut vertices = vec![base; ndim + 1];
    for i in 0..ndim {
        vertices[i + 1][i] += deltas[i];
    }
    vertices
}

fn amotry<F: FnMut(&[f64]) -> f64>(
    p: &mut [Vec<f64>],
    y: &mut [f64],
    psum: &mut [f64],
    f: &mut F,
    ihi: usize,
    fac: f64,
) -> f64 {
    let ndim = psum.len();
    let fac1 = (1.0 - fac) / ndim as f64;
    let fac2 = fac1 - fac;
    let ptry: Vec<f64> = (0..ndim).map(|j| psum[j] * fac1 - p[ihi][j] * fac2).collect();
    let ytry = f(&ptry);
    if ytry < y[ihi] {
        y[ihi] = ytry;
        for j in 0..ndim {
            psum[j] += ptry[j] - p[ihi][j];
            p[ihi][j] = ptry[j];
        }
    }
    ytry
}

/// Minimise `f` starting from the given `ndim + 1` vertices.
pub fn minimise<F: FnMut(&[f64]) -> f64>(
    mut f: F,
    vertices: Vec<Vec<f64>>,
    options: &SimplexOptions,
    cancel: Option<&CancelToken>,
) -> Result<SimplexOutcome, SimplexError> {
    let mpts = vertices.len();
    if mpts < 2 {
        return Err(SimplexError::ZeroDimensional);
    }
    let ndim = mpts - 1;
    if vertices.iter().any(|v| v.len() != ndim) {
        if vertices.iter().any(|v| v.len() != vertices[0].len()) {
            return Err(SimplexError::RaggedVertices);
        }
        return Err(SimplexError::WrongVertexCount {
            ndim: vertices[0].len(),
            got: mpts,
        });
    }

    let mut p = vertices;
    let mut y: Vec<f64> = p.iter().map(|v| f(v)).collect();
    let mut psum: Vec<f64> = (0..ndim)
        .map(|j| p.iter().map(|v| v[j]).sum())
        .collect();

    let mut nfunc = 0usize;
    let mut converged = false;
    let mut cancelled = false;

    loop {
        // Rank the vertices: lowest, highest, second highest.
        let mut ilo = 0;
        let (mut ihi, mut inhi) = if y[0] > y[1] { (0, 1) } else { (1, 0) };
        for i in 0..mpts {
            if y[i] <= y[ilo] {
                ilo = i;
            }
            if y[i] > y[ihi] {
                inhi = ihi;
                ihi = i;
            } else if y[i] > y[inhi] && i != ihi {
                inhi = i;
            }
        }

        let rtol = 2.0 * (y[ihi] - y[ilo]).abs() / (y[ihi].abs() + y[ilo].abs() + TINY);
        if rtol < options.tol {
            y.swap(0, ilo);
            p.swap(0, ilo);
            converged = true;
            break;
        }
        if nfunc >= options.max_evals {
            y.swap(0, ilo);
            p.swap(0, ilo);
            break;
        }
        if let Some(token) = cancel {
            if token.is_cancelled() {
                y.swap(0, ilo);
                p.swap(0, ilo);
                cancelled = true;
                break;
            }
        }

        nfunc += 2;
        let ytry = amotry(&mut p, &mut y, &mut psum, &mut f, ihi, -1.0);
        if ytry <= y[ilo] {
            amotry(&mut p, &mut y, &mut psum, &mut f, ihi, 2.0);
        } else if ytry >= y[inhi] {
            let ysave = y[ihi];
            let ytry = amotry(&mut p, &mut y, &mut psum, &mut f, ihi, 0.5);
            if ytry >= ysave {
                // Contract the whole simplex towards the best vertex.
                for i in 0..mpts {
                    if i != ilo {
                        for j in 0..ndim {
                            p[i][j] = 0.5 * (p[i][j] + p[ilo][j]);
                        }
                        y[i] = f(&p[i]);
                    }
                }
                nfunc += ndim;
                for (j, s) in psum.iter_mut().enumerate() {
                    *s = p.iter().map(|v| v[j]).sum();
                }
            }
        } else {
            nfunc -= 1;
        }
    }

    let spread = (0..ndim)
        .map(|j| {
            let mean = p.iter().map(|v| v[j]).sum::<f64>() / mpts as f64;
            let var = p.iter().map(|v| (v[j] - mean).powi(2)).sum::<f64>() / mpts as f64;
            var.sqrt()
        })
        .collect();

    Ok(SimplexOutcome {
        point: p[0].clone(),
        value: y[0],
        converged,
        cancelled,
        evals: nfunc,
        spread,
    })
}
