//! 3D detections: channel-keyed stacks of 2D objects with cached
//! aggregate parameters.

use std::collections::BTreeMap;

use shared::cube::Cube;
use shared::geometry;
use shared::header::Header;

use crate::object2d::Object2D;

/// One detected source: a sorted mapping from channel index to the 2D
/// object in that channel, plus aggregate quantities cached by
/// [`Detection::finalise`].
#[derive(Debug, Clone, Default)]
pub struct Detection {
    chanmap: BTreeMap<usize, Object2D>,

    // Cached aggregates, valid after finalise().
    pub voxel_count: usize,
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
    pub zmin: usize,
    pub zmax: usize,
    /// Flux-weighted centroid.
    pub x_centroid: f64,
    pub y_centroid: f64,
    pub z_centroid: f64,
    /// Unweighted mean voxel position.
    pub x_average: f64,
    pub y_average: f64,
    pub z_average: f64,
    pub total_flux: f64,
    /// Integrated spectrum over the detection's voxels, full channel range
    /// of the cube.
    pub spectrum: Vec<f64>,
    /// Full width at half maximum of the integrated spectrum, km/s.
    pub w50: f64,
    /// First-moment systemic velocity of the integrated spectrum, km/s.
    pub vsys: f64,
}

impl Detection {
    pub fn new() -> Detection {
        Detection::default()
    }

    pub fn add_pixel(&mut self, x: usize, y: usize, z: usize) {
        self.chanmap.entry(z).or_default().add_pixel(x, y);
    }

    pub fn add_object(&mut self, z: usize, obj: &Object2D) {
        self.chanmap.entry(z).or_default().merge(obj);
    }

    pub fn merge(&mut self, other: &Detection) {
        for (&z, obj) in &other.chanmap {
            self.add_object(z, obj);
        }
    }

    pub fn channel_map(&self) -> &BTreeMap<usize, Object2D> {
        &self.chanmap
    }

    pub fn object_at(&self, z: usize) -> Option<&Object2D> {
        self.chanmap.get(&z)
    }

    /// Number of distinct channels the detection spans.
    pub fn num_channels(&self) -> usize {
        self.chanmap.len()
    }

    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        self.chanmap.get(&z).map_or(false, |o| o.contains(x, y))
    }

    pub fn voxels(&self) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        for (&z, obj) in &self.chanmap {
            for (x, y) in obj.pixels() {
                out.push((x, y, z));
            }
        }
        out
    }

    /// Number of spatial pixels in the projected (moment-0) footprint.
    pub fn spatial_footprint(&self) -> usize {
        let mut flat = Object2D::new();
        for obj in self.chanmap.values() {
            flat.merge(obj);
        }
        flat.num_pix()
    }

    /// Largest per-channel pixel count.
    pub fn max_channel_pix(&self) -> usize {
        self.chanmap.values().map(Object2D::num_pix).max().unwrap_or(0)
    }

    /// 3D closeness test for linking: some pair of 2D objects within
    /// `zgap` channels whose footprints pass the spatial gap test.
    pub fn is_close(&self, other: &Detection, spatial_gap: usize, zgap: usize) -> bool {
        for (&za, obj_a) in &self.chanmap {
            for (&zb, obj_b) in &other.chanmap {
                let dz = (za as i64 - zb as i64).abs() as usize;
                if dz <= zgap && obj_a.is_close(obj_b, spatial_gap) {
                    return true;
                }
            }
        }
        false
    }

    /// Recompute all cached aggregates against the cube.
    pub fn finalise(&mut self, cube: &Cube, header: &Header) {
        let nz = cube.nz();
        let mut spectrum = vec![0.0; nz];
        let (mut xmin, mut xmax) = (usize::MAX, 0);
        let (mut ymin, mut ymax) = (usize::MAX, 0);
        let (mut zmin, mut zmax) = (usize::MAX, 0);
        let mut count = 0usize;
        let (mut fx, mut fy, mut fz, mut fsum) = (0.0, 0.0, 0.0, 0.0);
        let (mut sx, mut sy, mut sz) = (0.0, 0.0, 0.0);

        for (&z, obj) in &self.chanmap {
            zmin = zmin.min(z);
            zmax = zmax.max(z);
            for (x, y) in obj.pixels() {
                xmin = xmin.min(x);
                xmax = xmax.max(x);
                ymin = ymin.min(y);
                ymax = ymax.max(y);
                count += 1;
                sx += x as f64;
                sy += y as f64;
                sz += z as f64;
                let f = cube.get(x, y, z);
                if f.is_finite() {
                    spectrum[z] += f;
                    fsum += f;
                    fx += f * x as f64;
                    fy += f * y as f64;
                    fz += f * z as f64;
                }
            }
        }

        self.voxel_count = count;
        if count == 0 {
            return;
        }
        self.xmin = xmin;
        self.xmax = xmax;
        self.ymin = ymin;
        self.ymax = ymax;
        self.zmin = zmin;
        self.zmax = zmax;
        self.x_average = sx / count as f64;
        self.y_average = sy / count as f64;
        self.z_average = sz / count as f64;
        if fsum != 0.0 {
            self.x_centroid = fx / fsum;
            self.y_centroid = fy / fsum;
            self.z_centroid = fz / fsum;
        } else {
            self.x_centroid = self.x_average;
            self.y_centroid = self.y_average;
            self.z_centroid = self.z_average;
        }
        self.total_flux = fsum;

        // First moment of the integrated profile gives the systemic
        // velocity; the half-maximum crossings give W50.
        let vel: Vec<f64> = (0..nz)
            .map(|z| geometry::velocity_of(header, z as f64))
            .collect();
        let wsum: f64 = spectrum.iter().sum();
        if wsum > 0.0 {
            self.vsys = spectrum
                .iter()
                .zip(vel.iter())
                .map(|(s, v)| s * v)
                .sum::<f64>()
                / wsum;
        }
        self.w50 = w50(&spectrum, &vel);
        self.spectrum = spectrum;
    }
}

/// Full width of the profile at half its peak, with linear interpolation
/// between channels. Returns 0 when the profile has no positive peak.
fn w50(spectrum: &[f64], vel: &[f64]) -> f64 {
    let nz = spectrum.len();
    let (ipeak, &peak) = match spectrum
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        Some(p) => p,
        None => return 0.0,
    };
    if peak <= 0.0 {
        return 0.0;
    }
    let half = 0.5 * peak;

    let mut v_lo = vel[0];
    for i in (0..=ipeak).rev() {
        if spectrum[i] < half {
            let t = (half - spectrum[i]) / (spectrum[i + 1] - spectrum[i]);
            v_lo = vel[i] + t * (vel[i + 1] - vel[i]);
            break;
        }
    }
    let mut v_hi = vel[nz - 1];
    for i in ipeak..nz {
        if spectrum[i] < half {
            let t = (half - spectrum[i]) / (spectrum[i - 1] - spectrum[i]);
            v_hi = vel[i] + t * (vel[i - 1] - vel[i]);
            break;
        }
    }
    (v_hi - v_lo).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::header::{Beam, SpectralKind, VelocityDef};

    fn header(nz: usize) -> Header {
        Header {
            naxis: [16, 16, nz],
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
    fn aggregates_of_a_uniform_block() {
        let h = header(8);
        let mut cube = Cube::zeros(16, 16, 8);
        let mut det = Detection::new();
        for x in 4..=6 {
            for y in 2..=3 {
                for z in 1..=2 {
                    cube.data_mut()[[x, y, z]] = 2.0;
                    det.add_pixel(x, y, z);
                }
            }
        }
        det.finalise(&cube, &h);
        assert_eq!(det.voxel_count, 12);
        assert_eq!((det.xmin, det.xmax), (4, 6));
        assert_eq!((det.ymin, det.ymax), (2, 3));
        assert_eq!((det.zmin, det.zmax), (1, 2));
        assert_relative_eq!(det.x_centroid, 5.0);
        assert_relative_eq!(det.y_centroid, 2.5);
        assert_relative_eq!(det.total_flux, 24.0);
        assert_relative_eq!(det.x_average, 5.0);
        // Channels at 10 and 20 km/s with equal flux.
        assert_relative_eq!(det.vsys, 15.0, epsilon = 1e-9);
    }

    #[test]
    fn w50_of_a_triangular_profile() {
        // Peak 4 at v=20, linear sides; half max 2 crossed at v=10 and 30.
        let spectrum = [0.0, 2.0, 4.0, 2.0, 0.0];
        let vel = [0.0, 10.0, 20.0, 30.0, 40.0];
        assert_relative_eq!(w50(&spectrum, &vel), 20.0, epsilon = 1e-9);
    }

    #[test]
    fn linking_respects_gaps() {
        let mut a = Detection::new();
        a.add_pixel(3, 3, 2);
        let mut b = Detection::new();
        b.add_pixel(4, 4, 3);
        assert!(a.is_close(&b, 1, 1));
        assert!(!a.is_close(&b, 1, 0));

        let mut far = Detection::new();
        far.add_pixel(3, 3, 6);
        assert!(!a.is_close(&far, 1, 3));
        assert!(a.is_close(&far, 1, 4));
    }

    #[test]
    fn merge_combines_channel_maps() {
        let mut a = Detection::new();
        a.add_pixel(1, 1, 0);
        let mut b = Detection::new();
        b.add_pixel(2, 1, 0);
        b.add_pixel(5, 5, 3);
        a.merge(&b);
        assert_eq!(a.num_channels(), 2);
        assert_eq!(a.voxels().len(), 3);
        assert!(a.contains(2, 1, 0));
        assert!(a.contains(5, 5, 3));
    }
}
