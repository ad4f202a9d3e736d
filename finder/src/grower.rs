//! Growth of detected objects out to a secondary threshold.
//!
//! Every voxel carries one of three states. Voxels belonging to any primary
//! detection start as DETECTED, blank voxels as BLANK, everything else as
//! AVAILABLE. Growing walks outward from each detection's voxels and claims
//! AVAILABLE neighbours whose flux passes the growth threshold; only the
//! AVAILABLE → DETECTED transition ever happens, so two detections can
//! never claim the same voxel.

use shared::cube::Cube;

use crate::object3d::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoxelState {
    Available,
    Detected,
    Blank,
}

#[derive(Debug)]
pub struct ObjectGrower {
    state: Vec<VoxelState>,
    nx: usize,
    ny: usize,
    nz: usize,
    spatial_thresh: usize,
    velocity_thresh: usize,
    threshold: f64,
}

impl ObjectGrower {
    /// Flag every voxel of every detection as DETECTED and every blank
    /// voxel as BLANK before any growing starts.
    pub fn new(
        cube: &Cube,
        detections: &[Detection],
        threshold: f64,
        spatial_thresh: usize,
        velocity_thresh: usize,
    ) -> ObjectGrower {
        let (nx, ny, nz) = cube.dims();
        let mut state = vec![VoxelState::Available; nx * ny * nz];
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    if !cube.is_valid(x, y, z) {
                        state[x + y * nx + z * nx * ny] = VoxelState::Blank;
                    }
                }
            }
        }
        for det in detections {
            for (x, y, z) in det.voxels() {
                state[x + y * nx + z * nx * ny] = VoxelState::Detected;
            }
        }
        ObjectGrower {
            state,
            nx,
            ny,
            nz,
            spatial_thresh,
            velocity_thresh,
            threshold,
        }
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.nx + z * self.nx * self.ny
    }

    /// Grow one detection: repeatedly claim AVAILABLE neighbours above the
    /// threshold until no more voxels are added.
    pub fn grow(&mut self, detection: &mut Detection, cube: &Cube) {
        let mut worklist = detection.voxels();
        let mut head = 0;
        while head < worklist.len() {
            let (xpt, ypt, zpt) = worklist[head];
            head += 1;

            let x_lo = xpt.saturating_sub(self.spatial_thresh);
            let x_hi = (xpt + self.spatial_thresh).min(self.nx - 1);
            let y_lo = ypt.saturating_sub(self.spatial_thresh);
            let y_hi = (ypt + self.spatial_thresh).min(self.ny - 1);
            let z_lo = zpt.saturating_sub(self.velocity_thresh);
            let z_hi = (zpt + self.velocity_thresh).min(self.nz - 1);

            for x in x_lo..=x_hi {
                for y in y_lo..=y_hi {
                    for z in z_lo..=z_hi {
                        if (x, y, z) == (xpt, ypt, zpt) {
                            continue;
                        }
                        let idx = self.index(x, y, z);
                        if self.state[idx] == VoxelState::Available
                            && cube.get(x, y, z) > self.threshold
                        {
                            self.state[idx] = VoxelState::Detected;
                            detection.add_pixel(x, y, z);
                            worklist.push((x, y, z));
                        }
                    }
                }
            }
        }
    }
}
