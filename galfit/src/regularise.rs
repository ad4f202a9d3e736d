//! Second-pass smoothing of parameter radial profiles.
//!
//! After the per-ring fits, the chosen (usually geometric) parameters are
//! replaced by a smooth function of radius: a least-squares polynomial of
//! user-chosen degree, or a Bézier curve through the fitted values when the
//! degree is -1. Rings skipped as degenerate in the first pass take the
//! regularised value like every other ring.

use shared::algo::interp::{self, InterpError};

/// Smooth one parameter profile over radius.
///
/// `valid` flags the rings whose fitted value may be trusted; the smoothed
/// profile is evaluated at every radius regardless. `degree < 0` selects
/// Bézier smoothing. With fewer than two trusted rings the input values are
/// returned unchanged (a constant profile when exactly one is trusted).
pub fn regularise_profile(
    radii: &[f64],
    values: &[f64],
    valid: &[bool],
    degree: i32,
) -> Result<Vec<f64>, InterpError> {
    let trusted: Vec<(f64, f64)> = radii
        .iter()
        .zip(values.iter())
        .zip(valid.iter())
        .filter(|(_, &ok)| ok)
        .map(|((&r, &v), _)| (r, v))
        .collect();

    match trusted.len() {
        0 => Ok(values.to_vec()),
        1 => Ok(vec![trusted[0].1; radii.len()]),
        _ => {
            let xs: Vec<f64> = trusted.iter().map(|t| t.0).collect();
            let ys: Vec<f64> = trusted.iter().map(|t| t.1).collect();
            if degree < 0 {
                interp::bezier_at(&xs, &ys, radii)
            } else {
                let deg = (degree as usize).min(xs.len() - 1);
                let coeffs = interp::polyfit(&xs, &ys, deg)?;
                Ok(radii.iter().map(|&r| interp::polyval(&coeffs, r)).collect())
            }
        }
    }
}

/// Fill one parameter's value at an untrusted ring by linear interpolation
/// from the trusted neighbours, clamping to the nearest trusted value
/// beyond the ends of the profile.
pub fn interpolate_at(
    radii: &[f64],
    values: &[f64],
    valid: &[bool],
    radius: f64,
) -> Option<f64> {
    let xs: Vec<f64> = radii
        .iter()
        .zip(valid.iter())
        .filter(|(_, &ok)| ok)
        .map(|(&r, _)| r)
        .collect();
    let ys: Vec<f64> = values
        .iter()
        .zip(valid.iter())
        .filter(|(_, &ok)| ok)
        .map(|(&v, _)| v)
        .collect();
    match xs.len() {
        0 => None,
        1 => Some(ys[0]),
        _ => {
            let clamped = radius.clamp(xs[0], xs[xs.len() - 1]);
            interp::interp(clamped, &xs, &ys).ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_profile_is_recovered_by_degree_one() {
        let radii: Vec<f64> = (0..10).map(|i| 10.0 + 5.0 * i as f64).collect();
        // inc(r) = 50 + 0.1 r with alternating +-0.3 wiggle.
        let values: Vec<f64> = radii
            .iter()
            .enumerate()
            .map(|(i, &r)| 50.0 + 0.1 * r + if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        let valid = vec![true; radii.len()];
        let smooth = regularise_profile(&radii, &values, &valid, 1).unwrap();
        for (&r, &s) in radii.iter().zip(smooth.iter()) {
            assert!(
                (s - (50.0 + 0.1 * r)).abs() < 0.5,
                "residual too large at r={r}: {s}"
            );
        }
    }

    #[test]
    fn untrusted_rings_do_not_bias_the_fit() {
        let radii = [10.0, 20.0, 30.0, 40.0];
        let values = [1.0, 2.0, 500.0, 4.0];
        let valid = [true, true, false, true];
        let smooth = regularise_profile(&radii, &values, &valid, 1).unwrap();
        assert_relative_eq!(smooth[2], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn single_trusted_ring_gives_a_constant() {
        let radii = [10.0, 20.0, 30.0];
        let values = [7.0, 99.0, 99.0];
        let valid = [true, false, false];
        let smooth = regularise_profile(&radii, &values, &valid, 2).unwrap();
        assert_eq!(smooth, vec![7.0, 7.0, 7.0]);
    }

    #[test]
    fn bezier_mode_smooths_without_a_degree() {
        let radii = [10.0, 20.0, 30.0, 40.0, 50.0];
        let values = [0.0, 1.0, 0.0, 1.0, 0.0];
        let valid = [true; 5];
        let smooth = regularise_profile(&radii, &values, &valid, -1).unwrap();
        assert!(smooth[2] > 0.0 && smooth[2] < 1.0);
    }

    #[test]
    fn neighbour_interpolation_clamps_at_the_ends() {
        let radii = [10.0, 20.0, 30.0];
        let values = [1.0, 2.0, 3.0];
        let valid = [true, true, true];
        assert_relative_eq!(
            interpolate_at(&radii, &values, &valid, 15.0).unwrap(),
            1.5
        );
        assert_relative_eq!(interpolate_at(&radii, &values, &valid, 5.0).unwrap(), 1.0);
        assert_relative_eq!(
            interpolate_at(&radii, &values, &valid, 45.0).unwrap(),
            3.0
        );
        assert!(interpolate_at(&radii, &values, &[false; 3], 15.0).is_none());
    }
}
