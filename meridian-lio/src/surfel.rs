//! Surfel extraction
//!
//! Voxel-grids a motion-compensated sweep and fits a plane to every voxel
//! with enough points. A voxel passes when its point scatter is flat: the
//! smallest covariance eigenvalue must be a small fraction of the middle
//! one. Each surfel carries the timestamp of the sweep point nearest its
//! centroid, which anchors it on the trajectory.

use std::collections::{HashMap, VecDeque};

use nalgebra::{Matrix3, Vector3};

use crate::config::SurfelConfig;
use crate::state::{ImuState, LidarPoint, Surfel};
use crate::sweep::imu_pose_at;

/// Integer voxel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoxelKey {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl VoxelKey {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn from_point(p: &Vector3<f64>, voxel_size: f64) -> Self {
        Self {
            x: (p.x / voxel_size).floor() as i32,
            y: (p.y / voxel_size).floor() as i32,
            z: (p.z / voxel_size).floor() as i32,
        }
    }
}

/// Accumulated statistics for one voxel
#[derive(Default)]
struct VoxelAccumulator {
    sum: Vector3<f64>,
    sum_sq: Matrix3<f64>,
    point_indices: Vec<usize>,
}

impl VoxelAccumulator {
    fn add_point(&mut self, idx: usize, p: &Vector3<f64>) {
        self.sum += p;
        self.sum_sq += p * p.transpose();
        self.point_indices.push(idx);
    }

    fn count(&self) -> usize {
        self.point_indices.len()
    }
}

/// Persistent coarse index over every voxel that ever produced a surfel.
///
/// Write-through only: the optimizer never reads it.
#[derive(Default)]
pub struct GlobalVoxelMap {
    voxels: HashMap<VoxelKey, Vector3<f64>>,
}

impl GlobalVoxelMap {
    pub fn insert(&mut self, key: VoxelKey, centroid: Vector3<f64>) {
        self.voxels.insert(key, centroid);
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }
}

/// Extract surfels from an undistorted sweep.
///
/// Returns surfels sorted by timestamp so they can be appended to the
/// window deque without breaking its ordering invariant.
pub(crate) fn extract_surfels(
    sweep: &[LidarPoint],
    imu_states: &VecDeque<ImuState>,
    config: &SurfelConfig,
) -> VecDeque<Surfel> {
    let mut accumulators: HashMap<VoxelKey, VoxelAccumulator> = HashMap::new();
    for (idx, pt) in sweep.iter().enumerate() {
        let key = VoxelKey::from_point(&pt.position, config.voxel_size);
        accumulators.entry(key).or_default().add_point(idx, &pt.position);
    }

    let mut surfels: Vec<Surfel> = accumulators
        .into_iter()
        .filter_map(|(key, acc)| fit_plane(key, &acc, sweep, config))
        .map(|(key, centroid, normal, timestamp)| {
            let (pos, rot) = imu_pose_at(imu_states, timestamp);
            let inv = rot.inverse();
            Surfel {
                centroid,
                normal,
                local_centroid: inv * (centroid - pos),
                local_normal: inv * normal,
                timestamp,
                voxel: key,
            }
        })
        .collect();

    surfels.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    surfels.into()
}

/// Fit a plane to one voxel's points.
///
/// Returns `(key, centroid, normal, timestamp)` when the voxel is planar
/// enough, where the timestamp comes from the point nearest the centroid.
fn fit_plane(
    key: VoxelKey,
    acc: &VoxelAccumulator,
    sweep: &[LidarPoint],
    config: &SurfelConfig,
) -> Option<(VoxelKey, Vector3<f64>, Vector3<f64>, f64)> {
    let n = acc.count();
    if n < config.min_points_per_voxel {
        return None;
    }

    let nf = n as f64;
    let mean = acc.sum / nf;
    // Cov = (sum_sq - n * mean * mean^T) / (n - 1)
    let covariance = (acc.sum_sq - mean * mean.transpose() * nf) / (nf - 1.0);

    let eigen = covariance.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
    let lambda_min = eigen.eigenvalues[order[0]];
    let lambda_mid = eigen.eigenvalues[order[1]];

    if lambda_mid <= 0.0 || lambda_min > config.planarity_ratio * lambda_mid {
        return None;
    }

    let normal: Vector3<f64> = eigen.eigenvectors.column(order[0]).normalize();

    // Representative point: the sweep point nearest the centroid
    let rep = acc
        .point_indices
        .iter()
        .min_by(|&&a, &&b| {
            (sweep[a].position - mean)
                .norm_squared()
                .total_cmp(&(sweep[b].position - mean).norm_squared())
        })
        .copied()?;

    Some((key, mean, normal, sweep[rep].timestamp))
}
