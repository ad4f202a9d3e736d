//! The observed (or synthesised) spectroscopic data cube.
//!
//! A [`Cube`] is a contiguous 3D array of `f64` samples indexed `(x, y, z)`
//! with `z` the spectral axis, plus an optional boolean mask (true =
//! include). Blank voxels are NaN; the FITS loader maps the header blanking
//! value to NaN on read. The observation cube is never mutated after
//! construction; every component reads it through a shared reference.

use ndarray::{Array2, Array3, s};
use thiserror::Error;

use crate::geometry;
use crate::header::Header;

#[derive(Error, Debug)]
pub enum CubeError {
    #[error("data length {got} does not match dimensions {nx}x{ny}x{nz}")]
    ShapeMismatch {
        got: usize,
        nx: usize,
        ny: usize,
        nz: usize,
    },
    #[error("mask dimensions do not match cube dimensions")]
    MaskMismatch,
    #[error("cube contains no finite voxels")]
    AllBlank,
}

/// 3D spectroscopic cube with optional companion mask.
#[derive(Debug, Clone)]
pub struct Cube {
    data: Array3<f64>,
    mask: Option<Array3<bool>>,
}

impl Cube {
    pub fn zeros(nx: usize, ny: usize, nz: usize) -> Self {
        Cube {
            data: Array3::zeros((nx, ny, nz)),
            mask: None,
        }
    }

    pub fn from_array(data: Array3<f64>) -> Self {
        Cube { data, mask: None }
    }

    /// Build from a flat vector in x-fastest (FITS) order.
    pub fn from_fits_order(
        nx: usize,
        ny: usize,
        nz: usize,
        flat: &[f64],
    ) -> Result<Self, CubeError> {
        if flat.len() != nx * ny * nz {
            return Err(CubeError::ShapeMismatch {
                got: flat.len(),
                nx,
                ny,
                nz,
            });
        }
        let mut data = Array3::zeros((nx, ny, nz));
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    data[[x, y, z]] = flat[x + y * nx + z * nx * ny];
                }
            }
        }
        Ok(Cube { data, mask: None })
    }

    pub fn set_mask(&mut self, mask: Array3<bool>) -> Result<(), CubeError> {
        if mask.dim() != self.data.dim() {
            return Err(CubeError::MaskMismatch);
        }
        self.mask = Some(mask);
        Ok(())
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn nx(&self) -> usize {
        self.data.dim().0
    }

    pub fn ny(&self) -> usize {
        self.data.dim().1
    }

    pub fn nz(&self) -> usize {
        self.data.dim().2
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f64> {
        &mut self.data
    }

    pub fn mask(&self) -> Option<&Array3<bool>> {
        self.mask.as_ref()
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[[x, y, z]]
    }

    /// True when the voxel is finite and not excluded by the mask.
    pub fn is_valid(&self, x: usize, y: usize, z: usize) -> bool {
        if !self.data[[x, y, z]].is_finite() {
            return false;
        }
        match &self.mask {
            Some(m) => m[[x, y, z]],
            None => true,
        }
    }

    /// Flat view of the samples for the statistics routines.
    pub fn as_slice(&self) -> &[f64] {
        self.data
            .as_slice()
            .expect("cube data is contiguous by construction")
    }

    /// Integrated-intensity map: the sum over the spectral axis, skipping
    /// blank voxels. Pixels with no finite voxel at all are NaN.
    pub fn moment0(&self) -> Array2<f64> {
        let (nx, ny, nz) = self.dims();
        let mut map = Array2::zeros((nx, ny));
        for x in 0..nx {
            for y in 0..ny {
                let mut sum = 0.0;
                let mut any = false;
                for z in 0..nz {
                    let v = self.data[[x, y, z]];
                    if v.is_finite() {
                        sum += v;
                        any = true;
                    }
                }
                map[[x, y]] = if any { sum } else { f64::NAN };
            }
        }
        map
    }

    /// Flux-weighted mean velocity map in km/s. Pixels whose summed flux is
    /// not positive are NaN.
    pub fn velocity_field(&self, header: &Header) -> Array2<f64> {
        let (nx, ny, nz) = self.dims();
        let vel: Vec<f64> = (0..nz)
            .map(|z| geometry::velocity_of(header, z as f64))
            .collect();
        let mut map = Array2::from_elem((nx, ny), f64::NAN);
        for x in 0..nx {
            for y in 0..ny {
                let mut wsum = 0.0;
                let mut vsum = 0.0;
                for z in 0..nz {
                    let f = self.data[[x, y, z]];
                    if f.is_finite() && f > 0.0 {
                        wsum += f;
                        vsum += f * vel[z];
                    }
                }
                if wsum > 0.0 {
                    map[[x, y]] = vsum / wsum;
                }
            }
        }
        map
    }

    /// Integrated spectrum over the whole cube, one value per channel.
    pub fn spectrum(&self) -> Vec<f64> {
        let (_, _, nz) = self.dims();
        (0..nz)
            .map(|z| {
                self.data
                    .slice(s![.., .., z])
                    .iter()
                    .filter(|v| v.is_finite())
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Beam, SpectralKind, VelocityDef};
    use approx::assert_relative_eq;

    fn header(nz: usize) -> Header {
        Header {
            naxis: [3, 3, nz],
            crpix: [1.0, 1.0, 1.0],
            crval: [0.0, 0.0, 0.0],
            cdelt: [-1.0 / 3600.0, 1.0 / 3600.0, 1.0e4],
            pixscale: 1.0,
            spectral_kind: SpectralKind::Velocity,
            veldef: VelocityDef::Radio,
            rest_value: 0.0,
            beam: Beam::unknown(),
            flux_unit: String::new(),
            blank: None,
        }
    }

    #[test]
    fn fits_order_maps_x_fastest() {
        let flat: Vec<f64> = (0..2 * 3 * 2).map(|i| i as f64).collect();
        let cube = Cube::from_fits_order(2, 3, 2, &flat).unwrap();
        assert_eq!(cube.get(0, 0, 0), 0.0);
        assert_eq!(cube.get(1, 0, 0), 1.0);
        assert_eq!(cube.get(0, 1, 0), 2.0);
        assert_eq!(cube.get(0, 0, 1), 6.0);
    }

    #[test]
    fn moment0_skips_blanks() {
        let mut cube = Cube::zeros(3, 3, 4);
        cube.data_mut()[[1, 1, 0]] = 2.0;
        cube.data_mut()[[1, 1, 1]] = 3.0;
        cube.data_mut()[[1, 1, 2]] = f64::NAN;
        let map = cube.moment0();
        assert_relative_eq!(map[[1, 1]], 5.0);
        assert_relative_eq!(map[[0, 0]], 0.0);
    }

    #[test]
    fn velocity_field_is_flux_weighted() {
        let h = header(4);
        let mut cube = Cube::zeros(3, 3, 4);
        // Channels are at 0, 10, 20, 30 km/s.
        cube.data_mut()[[0, 0, 1]] = 1.0;
        cube.data_mut()[[0, 0, 3]] = 3.0;
        let v = cube.velocity_field(&h);
        assert_relative_eq!(v[[0, 0]], (10.0 + 3.0 * 30.0) / 4.0, epsilon = 1e-12);
        assert!(v[[2, 2]].is_nan());
    }
}
