//! Dual-threshold connected-component search over the cube.
//!
//! The primary threshold seeds runs of bright voxels along the chosen axis;
//! runs merge into per-channel 2D objects under the spatial gap test, 2D
//! objects link into 3D detections under the velocity gap test, detected
//! objects optionally grow outward to a secondary threshold, and the
//! survivors of the rejection rules come back sorted by descending voxel
//! count.

use thiserror::Error;
use tracing::debug;

use shared::cube::Cube;
use shared::header::Header;
use shared::stats::{self, StatsError, ThresholdSpec};

use crate::grower::ObjectGrower;
use crate::object2d::Object2D;
use crate::object3d::Detection;
use crate::scan::Scan;

/// Axis along which the primary runs are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    /// Runs along x within each (y, z) image row.
    Spatial,
    /// Runs along the spectral axis for each spatial pixel.
    Spectral,
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub primary: ThresholdSpec,
    /// Grow detections out to this secondary threshold when `grow` is set.
    pub secondary: ThresholdSpec,
    pub grow: bool,
    pub kind: SearchKind,
    /// Strictly-adjacent merging; overrides the gap sizes with 1.
    pub flag_adjacent: bool,
    pub spatial_gap: usize,
    pub velocity_gap: usize,
    /// Minimum spatial pixels in the projected footprint.
    pub min_pix: usize,
    /// Minimum number of distinct channels.
    pub min_channels: usize,
    pub min_voxels: usize,
    /// Maximum number of distinct channels; 0 disables the cut.
    pub max_channels: usize,
    /// Re-run the 3D linking on the survivors with the relaxed gaps below.
    pub two_stage: bool,
    pub relaxed_spatial_gap: usize,
    pub relaxed_velocity_gap: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            primary: ThresholdSpec::Snr(4.0),
            secondary: ThresholdSpec::Snr(2.5),
            grow: false,
            kind: SearchKind::Spatial,
            flag_adjacent: true,
            spatial_gap: 3,
            velocity_gap: 3,
            min_pix: 2,
            min_channels: 2,
            min_voxels: 4,
            max_channels: 0,
            two_stage: false,
            relaxed_spatial_gap: 6,
            relaxed_velocity_gap: 6,
        }
    }
}

impl SearchOptions {
    fn gap_2d(&self) -> usize {
        if self.flag_adjacent {
            1
        } else {
            self.spatial_gap
        }
    }

    fn gap_z(&self) -> usize {
        if self.flag_adjacent {
            1
        } else {
            self.velocity_gap
        }
    }
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("cube statistics failed: {0}")]
    Stats(#[from] StatsError),
}

/// Run the full search. Detections come back finalised and sorted by
/// descending voxel count.
pub fn search(
    cube: &Cube,
    header: &Header,
    options: &SearchOptions,
) -> Result<Vec<Detection>, SearchError> {
    let mask_flat = cube.mask().and_then(|m| m.as_slice());
    let cube_stats = stats::compute(cube.as_slice(), mask_flat)?;
    let primary = options.primary.resolve(&cube_stats);

    let per_channel = primary_scans(cube, primary, options.kind);
    let n_seeds: usize = per_channel.iter().map(Vec::len).sum();

    // Per-channel 2D merging, then 3D linking across channels.
    let gap = options.gap_2d();
    let mut detections: Vec<Detection> = Vec::new();
    for (z, scans) in per_channel.into_iter().enumerate() {
        for obj in merge_scans(scans, gap) {
            link_object(&mut detections, z, obj, gap, options.gap_z());
        }
    }

    debug!(
        seeds = n_seeds,
        objects = detections.len(),
        threshold = primary,
        "primary search complete"
    );

    if options.grow {
        let secondary = options.secondary.resolve(&cube_stats);
        let mut grower = ObjectGrower::new(cube, &detections, secondary, gap, options.gap_z());
        for det in detections.iter_mut() {
            grower.grow(det, cube);
        }
    }

    detections.retain(|d| {
        d.num_channels() >= options.min_channels
            && d.spatial_footprint() >= options.min_pix
            && d.voxels().len() >= options.min_voxels
            && (options.max_channels == 0 || d.num_channels() <= options.max_channels)
    });

    if options.two_stage {
        detections = relink(
            detections,
            options.relaxed_spatial_gap,
            options.relaxed_velocity_gap,
        );
    }

    for det in detections.iter_mut() {
        det.finalise(cube, header);
    }
    detections.sort_by(|a, b| b.voxel_count.cmp(&a.voxel_count));
    Ok(detections)
}

/// Extract the primary-threshold runs, grouped per channel.
fn primary_scans(cube: &Cube, threshold: f64, kind: SearchKind) -> Vec<Vec<Scan>> {
    let (nx, ny, nz) = cube.dims();
    let mut per_channel: Vec<Vec<Scan>> = vec![Vec::new(); nz];
    let above = |x: usize, y: usize, z: usize| -> bool {
        cube.is_valid(x, y, z) && cube.get(x, y, z) > threshold
    };

    match kind {
        SearchKind::Spatial => {
            for z in 0..nz {
                for y in 0..ny {
                    let mut x = 0;
                    while x < nx {
                        if above(x, y, z) {
                            let x0 = x;
                            while x + 1 < nx && above(x + 1, y, z) {
                                x += 1;
                            }
                            per_channel[z].push(Scan::new(y, x0, x));
                        }
                        x += 1;
                    }
                }
            }
        }
        SearchKind::Spectral => {
            for x in 0..nx {
                for y in 0..ny {
                    let mut z = 0;
                    while z < nz {
                        if above(x, y, z) {
                            let z0 = z;
                            while z + 1 < nz && above(x, y, z + 1) {
                                z += 1;
                            }
                            for zc in z0..=z {
                                per_channel[zc].push(Scan::new(y, x, x));
                            }
                        }
                        z += 1;
                    }
                }
            }
        }
    }
    per_channel
}

/// Merge a channel's scans into connected 2D objects under the gap test.
fn merge_scans(scans: Vec<Scan>, gap: usize) -> Vec<Object2D> {
    let mut objects: Vec<Object2D> = Vec::new();
    for scan in scans {
        let probe = Object2D::from_scan(scan);
        let mut matches: Vec<usize> = objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_close(&probe, gap))
            .map(|(i, _)| i)
            .collect();
        match matches.first().copied() {
            None => objects.push(probe),
            Some(first) => {
                objects[first].merge(&probe);
                // Fold any further matching objects into the first.
                while let Some(i) = matches.pop() {
                    if i == first {
                        break;
                    }
                    let absorbed = objects.swap_remove(i);
                    objects[first].merge(&absorbed);
                }
            }
        }
    }
    objects
}

/// Link one channel object into the growing detection list.
fn link_object(
    detections: &mut Vec<Detection>,
    z: usize,
    obj: Object2D,
    spatial_gap: usize,
    zgap: usize,
) {
    let mut probe = Detection::new();
    probe.add_object(z, &obj);

    let matches: Vec<usize> = detections
        .iter()
        .enumerate()
        .filter(|(_, d)| d.is_close(&probe, spatial_gap, zgap))
        .map(|(i, _)| i)
        .collect();

    match matches.first().copied() {
        None => detections.push(probe),
        Some(first) => {
            detections[first].merge(&probe);
            for &i in matches.iter().skip(1).rev() {
                let absorbed = detections.swap_remove(i);
                detections[first].merge(&absorbed);
            }
        }
    }
}

/// Second-stage merging: re-link the surviving detections under relaxed
/// gaps.
fn relink(detections: Vec<Detection>, spatial_gap: usize, zgap: usize) -> Vec<Detection> {
    let mut merged: Vec<Detection> = Vec::new();
    for det in detections {
        let matches: Vec<usize> = merged
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_close(&det, spatial_gap, zgap))
            .map(|(i, _)| i)
            .collect();
        match matches.first().copied() {
            None => merged.push(det),
            Some(first) => {
                merged[first].merge(&det);
                for &i in matches.iter().skip(1).rev() {
                    let absorbed = merged.swap_remove(i);
                    merged[first].merge(&absorbed);
                }
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;
    use shared::header::{Beam, SpectralKind, VelocityDef};

    fn header(nx: usize, ny: usize, nz: usize) -> Header {
        Header {
            naxis: [nx, ny, nz],
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

    /// Unit Gaussian noise with the tails clamped at 3.5 sigma, so the
    /// 4-sigma primary cut cannot seed on noise. The robust statistics are
    /// insensitive to the clamp.
    fn noise_cube(nx: usize, ny: usize, nz: usize, seed: u64) -> Cube {
        let mut cube = Cube::zeros(nx, ny, nz);
        let mut rng = StdRng::seed_from_u64(seed);
        for v in cube.data_mut().iter_mut() {
            let n: f64 = rng.sample(StandardNormal);
            *v = n.clamp(-3.5, 3.5);
        }
        cube
    }

    fn insert_line(cube: &mut Cube, x: usize, y: usize, z0: usize, len: usize, flux: f64) {
        for z in z0..z0 + len {
            cube.data_mut()[[x, y, z]] = flux;
        }
    }

    #[test]
    fn single_bright_line_yields_one_detection() {
        // Gaussian noise sigma 1 with a 5-voxel spectral line of flux 10.
        let (nx, ny, nz) = (24, 24, 24);
        let h = header(nx, ny, nz);
        let mut cube = noise_cube(nx, ny, nz, 11);
        insert_line(&mut cube, 12, 12, 9, 5, 10.0);

        let opts = SearchOptions {
            primary: ThresholdSpec::Snr(4.0),
            secondary: ThresholdSpec::Snr(2.0),
            grow: true,
            flag_adjacent: true,
            min_pix: 1,
            min_channels: 3,
            min_voxels: 5,
            ..SearchOptions::default()
        };
        let dets = search(&cube, &h, &opts).unwrap();
        assert_eq!(dets.len(), 1, "expected exactly one detection");
        assert!(dets[0].voxel_count >= 5);
        assert!(dets[0].contains(12, 12, 11));
    }

    #[test]
    fn detections_are_sorted_by_voxel_count() {
        let (nx, ny, nz) = (24, 24, 16);
        let h = header(nx, ny, nz);
        let mut cube = Cube::zeros(nx, ny, nz);
        insert_line(&mut cube, 5, 5, 2, 8, 10.0);
        insert_line(&mut cube, 18, 18, 2, 4, 10.0);

        let opts = SearchOptions {
            primary: ThresholdSpec::Absolute(5.0),
            min_pix: 1,
            min_channels: 2,
            min_voxels: 2,
            ..SearchOptions::default()
        };
        let dets = search(&cube, &h, &opts).unwrap();
        assert_eq!(dets.len(), 2);
        assert!(dets[0].voxel_count > dets[1].voxel_count);
    }

    #[test]
    fn translation_moves_detections_rigidly() {
        let (nx, ny, nz) = (28, 28, 16);
        let h = header(nx, ny, nz);
        let mut base = Cube::zeros(nx, ny, nz);
        for (dx, dy, dz) in [(0, 0, 0), (1, 0, 0), (0, 1, 0), (1, 1, 1), (0, 0, 1)] {
            base.data_mut()[[8 + dx, 9 + dy, 4 + dz]] = 10.0;
        }
        let mut shifted = Cube::zeros(nx, ny, nz);
        for ((x, y, z), &v) in base.data().indexed_iter() {
            if v != 0.0 {
                shifted.data_mut()[[x + 5, y + 3, z + 2]] = v;
            }
        }

        let opts = SearchOptions {
            primary: ThresholdSpec::Absolute(5.0),
            min_pix: 1,
            min_channels: 1,
            min_voxels: 1,
            ..SearchOptions::default()
        };
        let a = search(&base, &h, &opts).unwrap();
        let b = search(&shifted, &h, &opts).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a[0].voxel_count, b[0].voxel_count);
        assert_eq!(b[0].xmin, a[0].xmin + 5);
        assert_eq!(b[0].ymin, a[0].ymin + 3);
        assert_eq!(b[0].zmin, a[0].zmin + 2);
    }

    #[test]
    fn spectral_search_finds_the_same_object() {
        let (nx, ny, nz) = (20, 20, 20);
        let h = header(nx, ny, nz);
        let mut cube = Cube::zeros(nx, ny, nz);
        insert_line(&mut cube, 10, 10, 5, 6, 8.0);
        insert_line(&mut cube, 11, 10, 5, 6, 8.0);

        for kind in [SearchKind::Spatial, SearchKind::Spectral] {
            let opts = SearchOptions {
                primary: ThresholdSpec::Absolute(4.0),
                kind,
                min_pix: 1,
                min_channels: 2,
                min_voxels: 2,
                ..SearchOptions::default()
            };
            let dets = search(&cube, &h, &opts).unwrap();
            assert_eq!(dets.len(), 1);
            assert_eq!(dets[0].voxel_count, 12);
        }
    }

    #[test]
    fn rejection_rules_drop_small_objects() {
        let (nx, ny, nz) = (16, 16, 16);
        let h = header(nx, ny, nz);
        let mut cube = Cube::zeros(nx, ny, nz);
        cube.data_mut()[[4, 4, 4]] = 10.0; // single voxel
        insert_line(&mut cube, 10, 10, 4, 6, 10.0);

        let opts = SearchOptions {
            primary: ThresholdSpec::Absolute(5.0),
            min_pix: 1,
            min_channels: 3,
            min_voxels: 3,
            ..SearchOptions::default()
        };
        let dets = search(&cube, &h, &opts).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].voxel_count, 6);

        // A max-channels cut rejects the long line too.
        let opts = SearchOptions {
            max_channels: 4,
            ..opts
        };
        assert!(search(&cube, &h, &opts).unwrap().is_empty());
    }

    #[test]
    fn two_stage_merging_joins_split_halves() {
        let (nx, ny, nz) = (24, 24, 12);
        let h = header(nx, ny, nz);
        let mut cube = Cube::zeros(nx, ny, nz);
        // Two blobs 4 pixels apart: farther than the adjacent first-stage
        // linking reaches, within the relaxed second-stage gap.
        for z in 3..6 {
            for x in 6..9 {
                cube.data_mut()[[x, 10, z]] = 10.0;
                cube.data_mut()[[x + 7, 10, z]] = 10.0;
            }
        }
        let strict = SearchOptions {
            primary: ThresholdSpec::Absolute(5.0),
            min_pix: 1,
            min_channels: 2,
            min_voxels: 2,
            ..SearchOptions::default()
        };
        assert_eq!(search(&cube, &h, &strict).unwrap().len(), 2);

        let relaxed = SearchOptions {
            two_stage: true,
            relaxed_spatial_gap: 5,
            relaxed_velocity_gap: 2,
            ..strict
        };
        let dets = search(&cube, &h, &relaxed).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].voxel_count, 18);
    }
}
