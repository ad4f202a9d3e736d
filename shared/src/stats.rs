//! Robust location and scale estimators.
//!
//! The source finder and the parameter guesser characterise noise with the
//! median and the MADFM (median absolute deviation from the median) rather
//! than the mean and standard deviation, since the cube is dominated by
//! emission-free voxels with occasional bright signal. For Gaussian noise
//! `sigma = MADFM / 0.6745`.
//!
//! All estimators accept an optional boolean mask and ignore non-finite
//! values. Medians are computed with `select_nth_unstable` partitioning on a
//! scratch buffer, leaving the input untouched.

use num_traits::Float;
use thiserror::Error;

/// MADFM-to-sigma conversion factor for Gaussian statistics.
pub const MADFM_TO_SIGMA: f64 = 0.6744888;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("no valid values ({total} total, all masked or non-finite)")]
    NoValidData { total: usize },
    #[error("mask length {mask} does not match data length {data}")]
    MaskMismatch { mask: usize, data: usize },
}

/// Robust summary of an array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustStats {
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
    pub madfm: f64,
}

impl RobustStats {
    /// Gaussian-equivalent noise level from the MADFM.
    pub fn sigma_robust(&self) -> f64 {
        self.madfm / MADFM_TO_SIGMA
    }
}

/// Detection threshold in flux units, with the sense of the cut.
///
/// `below_too` widens the test to `|value| >= threshold` relative to the
/// middle, used when negative detections matter (noise calibration).
#[derive(Debug, Clone, Copy)]
pub struct DetectionThreshold {
    pub value: f64,
    pub middle: f64,
    pub below_too: bool,
}

impl DetectionThreshold {
    pub fn is_detection(&self, flux: f64) -> bool {
        if !flux.is_finite() {
            return false;
        }
        if self.below_too {
            (flux - self.middle).abs() >= (self.value - self.middle).abs()
        } else {
            flux >= self.value
        }
    }
}

/// Absolute flux cut or a signal-to-noise cut referred to the robust noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdSpec {
    Absolute(f64),
    Snr(f64),
}

impl ThresholdSpec {
    /// Resolve against the cube statistics: SNR cuts become
    /// `median + n * madfm/0.6745`.
    pub fn resolve(&self, stats: &RobustStats) -> f64 {
        match *self {
            ThresholdSpec::Absolute(v) => v,
            ThresholdSpec::Snr(n) => stats.median + n * stats.sigma_robust(),
        }
    }
}

fn collect_valid<T: Float>(data: &[T], mask: Option<&[bool]>) -> Result<Vec<T>, StatsError> {
    if let Some(m) = mask {
        if m.len() != data.len() {
            return Err(StatsError::MaskMismatch {
                mask: m.len(),
                data: data.len(),
            });
        }
    }
    let valid: Vec<T> = data
        .iter()
        .enumerate()
        .filter(|(i, v)| v.is_finite() && mask.map_or(true, |m| m[*i]))
        .map(|(_, v)| *v)
        .collect();
    if valid.is_empty() {
        return Err(StatsError::NoValidData { total: data.len() });
    }
    Ok(valid)
}

fn median_in_place<T: Float>(buf: &mut [T]) -> T {
    let n = buf.len();
    let cmp = |a: &T, b: &T| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal);
    if n % 2 == 1 {
        let (_, mid, _) = buf.select_nth_unstable_by(n / 2, cmp);
        *mid
    } else {
        let (lo, hi, _) = buf.select_nth_unstable_by(n / 2, cmp);
        let below = lo
            .iter()
            .copied()
            .fold(T::neg_infinity(), |a, b| if b > a { b } else { a });
        (below + *hi) / T::from(2.0).unwrap()
    }
}

/// Median of the valid values, input left untouched.
pub fn median<T: Float>(data: &[T], mask: Option<&[bool]>) -> Result<T, StatsError> {
    let mut buf = collect_valid(data, mask)?;
    Ok(median_in_place(&mut buf))
}

/// Median absolute deviation from the given median.
pub fn madfm<T: Float>(data: &[T], mask: Option<&[bool]>, med: T) -> Result<T, StatsError> {
    let valid = collect_valid(data, mask)?;
    let mut dev: Vec<T> = valid.iter().map(|&v| (v - med).abs()).collect();
    Ok(median_in_place(&mut dev))
}

/// Compute the full robust summary in one pass over the valid values.
pub fn compute<T: Float>(data: &[T], mask: Option<&[bool]>) -> Result<RobustStats, StatsError> {
    let mut valid = collect_valid(data, mask)?;
    let n = valid.len();
    let nf = T::from(n).unwrap();

    let sum = valid.iter().fold(T::zero(), |a, &b| a + b);
    let mean = sum / nf;
    let var = valid
        .iter()
        .fold(T::zero(), |a, &b| a + (b - mean) * (b - mean))
        / nf;
    let med = median_in_place(&mut valid);
    // Reuse the scratch buffer for the deviations.
    for v in valid.iter_mut() {
        *v = (*v - med).abs();
    }
    let mad = median_in_place(&mut valid);

    Ok(RobustStats {
        mean: mean.to_f64().unwrap_or(f64::NAN),
        stddev: var.sqrt().to_f64().unwrap_or(f64::NAN),
        median: med.to_f64().unwrap_or(f64::NAN),
        madfm: mad.to_f64().unwrap_or(f64::NAN),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn median_odd_and_even() {
        assert_relative_eq!(median(&[3.0, 1.0, 2.0], None).unwrap(), 2.0);
        assert_relative_eq!(median(&[4.0, 1.0, 3.0, 2.0], None).unwrap(), 2.5);
    }

    #[test]
    fn median_ignores_nan() {
        let data = [1.0, f64::NAN, 3.0, 2.0, f64::NAN];
        assert_relative_eq!(median(&data, None).unwrap(), 2.0);
    }

    #[test]
    fn all_invalid_is_an_error() {
        let data = [f64::NAN, f64::NAN];
        assert!(matches!(
            compute(&data, None),
            Err(StatsError::NoValidData { total: 2 })
        ));
    }

    #[test]
    fn mask_selects_values() {
        let data = [10.0, 1.0, 2.0, 3.0, 10.0];
        let mask = [false, true, true, true, false];
        let s = compute(&data, Some(&mask)).unwrap();
        assert_relative_eq!(s.median, 2.0);
        assert_relative_eq!(s.mean, 2.0);
    }

    #[test]
    fn madfm_of_known_sample() {
        // deviations from median 5: [4, 1, 0, 1, 4] -> madfm 1
        let data = [1.0, 4.0, 5.0, 6.0, 9.0];
        let s = compute(&data, None).unwrap();
        assert_relative_eq!(s.median, 5.0);
        assert_relative_eq!(s.madfm, 1.0);
    }

    #[test]
    fn input_is_not_destroyed() {
        let data = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let copy = data.clone();
        let _ = compute(&data, None).unwrap();
        assert_eq!(data, copy);
    }

    #[test]
    fn snr_threshold_uses_robust_sigma() {
        let stats = RobustStats {
            mean: 0.0,
            stddev: 1.0,
            median: 0.5,
            madfm: MADFM_TO_SIGMA,
        };
        let t = ThresholdSpec::Snr(4.0).resolve(&stats);
        assert_relative_eq!(t, 0.5 + 4.0, epsilon = 1e-12);
        assert_relative_eq!(ThresholdSpec::Absolute(7.0).resolve(&stats), 7.0);
    }

    #[test]
    fn below_too_detects_both_signs() {
        let t = DetectionThreshold {
            value: 4.0,
            middle: 0.0,
            below_too: true,
        };
        assert!(t.is_detection(5.0));
        assert!(t.is_detection(-5.0));
        assert!(!t.is_detection(3.0));

        let above = DetectionThreshold {
            value: 4.0,
            middle: 0.0,
            below_too: false,
        };
        assert!(!above.is_detection(-5.0));
    }
}
