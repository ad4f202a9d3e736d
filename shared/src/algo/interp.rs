//! Interpolation and profile smoothing: linear interpolation, least-squares
//! polynomial fits and Bézier smoothing of radial profiles.
//!
//! The regularisation pass of the fitter smooths each free parameter's
//! radial profile either with a polynomial of user-chosen degree or, for
//! degree −1, with a Bézier curve through the per-ring values.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("input vectors must have the same length ({x} vs {y})")]
    MismatchedLengths { x: usize, y: usize },
    #[error("need at least {need} points, got {got}")]
    InsufficientData { need: usize, got: usize },
    #[error("x values must be sorted in ascending order")]
    UnsortedData,
    #[error("value {0} is out of bounds for interpolation range [{1}, {2}]")]
    OutOfBounds(f64, f64, f64),
    #[error("polynomial degree {degree} needs more than {points} points")]
    DegreeTooHigh { degree: usize, points: usize },
    #[error("normal equations are singular")]
    Singular,
}

/// Linear interpolation with binary search over sorted abscissae.
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64, InterpError> {
    if xs.len() != ys.len() {
        return Err(InterpError::MismatchedLengths {
            x: xs.len(),
            y: ys.len(),
        });
    }
    if xs.len() < 2 {
        return Err(InterpError::InsufficientData {
            need: 2,
            got: xs.len(),
        });
    }
    if xs.windows(2).any(|w| w[0] >= w[1]) {
        return Err(InterpError::UnsortedData);
    }
    let (lo, hi) = (xs[0], xs[xs.len() - 1]);
    if x < lo || x > hi {
        return Err(InterpError::OutOfBounds(x, lo, hi));
    }
    let i = match xs.partition_point(|&v| v <= x) {
        0 => 0,
        n if n >= xs.len() => xs.len() - 2,
        n => n - 1,
    };
    let t = (x - xs[i]) / (xs[i + 1] - xs[i]);
    Ok(ys[i] + t * (ys[i + 1] - ys[i]))
}

/// Least-squares polynomial fit of the given degree; returns coefficients
/// lowest order first.
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Result<Vec<f64>, InterpError> {
    if xs.len() != ys.len() {
        return Err(InterpError::MismatchedLengths {
            x: xs.len(),
            y: ys.len(),
        });
    }
    let n = xs.len();
    let m = degree + 1;
    if n < m {
        return Err(InterpError::DegreeTooHigh { degree, points: n });
    }

    // Normal equations A^T A c = A^T y for the Vandermonde matrix A.
    let mut ata = vec![vec![0.0; m]; m];
    let mut aty = vec![0.0; m];
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        let mut pow = vec![1.0; 2 * m - 1];
        for k in 1..2 * m - 1 {
            pow[k] = pow[k - 1] * x;
        }
        for i in 0..m {
            aty[i] += pow[i] * y;
            for j in 0..m {
                ata[i][j] += pow[i + j];
            }
        }
    }
    solve(ata, aty)
}

/// Evaluate a polynomial given coefficients lowest order first.
pub fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

// Gaussian elimination with partial pivoting on a small dense system.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>, InterpError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                a[i][col]
                    .abs()
                    .partial_cmp(&a[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or(InterpError::Singular)?;
        if a[pivot][col].abs() < 1.0e-12 {
            return Err(InterpError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for k in row + 1..n {
            sum -= a[row][k] * x[k];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

/// Smooth a profile with a Bézier curve through the data points and return
/// the smoothed values back at the original abscissae.
///
/// The data points act as the control polygon; the curve is sampled densely
/// in the Bernstein parameter and mapped back to the (monotonic) x grid by
/// linear interpolation.
pub fn bezier_at(xs: &[f64], ys: &[f64], xq: &[f64]) -> Result<Vec<f64>, InterpError> {
    if xs.len() != ys.len() {
        return Err(InterpError::MismatchedLengths {
            x: xs.len(),
            y: ys.len(),
        });
    }
    if xs.len() < 2 {
        return Err(InterpError::InsufficientData {
            need: 2,
            got: xs.len(),
        });
    }
    if xs.windows(2).any(|w| w[0] >= w[1]) {
        return Err(InterpError::UnsortedData);
    }

    let n = xs.len() - 1;
    // Binomial coefficients C(n, i) built iteratively in f64.
    let mut binom = vec![1.0; n + 1];
    for i in 1..=n {
        binom[i] = binom[i - 1] * (n - i + 1) as f64 / i as f64;
    }

    let samples = (xs.len() * 32).max(256);
    let mut bx = Vec::with_capacity(samples);
    let mut by = Vec::with_capacity(samples);
    for s in 0..samples {
        let t = s as f64 / (samples - 1) as f64;
        let mut px = 0.0;
        let mut py = 0.0;
        for i in 0..=n {
            let b = binom[i] * t.powi(i as i32) * (1.0 - t).powi((n - i) as i32);
            px += b * xs[i];
            py += b * ys[i];
        }
        bx.push(px);
        by.push(py);
    }

    xq.iter()
        .map(|&x| {
            let clamped = x.clamp(bx[0], bx[samples - 1]);
            interp(clamped, &bx, &by)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_interp_basics() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [0.0, 2.0, 4.0, 6.0];
        assert_relative_eq!(interp(1.5, &xs, &ys).unwrap(), 3.0);
        assert_relative_eq!(interp(2.0, &xs, &ys).unwrap(), 4.0);
        assert!(matches!(
            interp(5.0, &xs, &ys),
            Err(InterpError::OutOfBounds(..))
        ));
    }

    #[test]
    fn polyfit_recovers_exact_polynomial() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 2.0 - 3.0 * x + 0.5 * x * x).collect();
        let c = polyfit(&xs, &ys, 2).unwrap();
        assert_relative_eq!(c[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(c[1], -3.0, epsilon = 1e-8);
        assert_relative_eq!(c[2], 0.5, epsilon = 1e-8);
        assert_relative_eq!(polyval(&c, 4.0), 2.0 - 12.0 + 8.0, epsilon = 1e-8);
    }

    #[test]
    fn polyfit_degree_needs_enough_points() {
        assert!(matches!(
            polyfit(&[0.0, 1.0], &[1.0, 2.0], 3),
            Err(InterpError::DegreeTooHigh { .. })
        ));
    }

    #[test]
    fn bezier_interpolates_endpoints_and_smooths() {
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys = [0.0, 1.0, 0.0, 1.0, 0.0];
        let sm = bezier_at(&xs, &ys, &xs).unwrap();
        // A Bézier curve passes through the first and last control points
        // and stays within the control polygon's value range.
        assert_relative_eq!(sm[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(sm[4], 0.0, epsilon = 1e-6);
        for v in &sm {
            assert!((-1e-9..=1.0 + 1e-9).contains(v));
        }
        // Smoothing damps the zig-zag: interior values pulled towards the mean.
        assert!(sm[1] < 1.0 && sm[1] > 0.0);
    }

    #[test]
    fn bezier_of_line_is_the_line() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let sm = bezier_at(&xs, &ys, &xs).unwrap();
        for (a, b) in sm.iter().zip(ys.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }
}
