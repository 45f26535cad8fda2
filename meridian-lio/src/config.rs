//! Estimator configuration

use nalgebra::{Isometry3, Vector3};

/// Axis-aligned bounding box, used to blank out returns from the vehicle
/// body around the sensor origin.
#[derive(Debug, Clone, Copy)]
pub struct Aabb {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl Aabb {
    pub fn new(min: Vector3<f64>, max: Vector3<f64>) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

/// Surfel extraction parameters
#[derive(Debug, Clone)]
pub struct SurfelConfig {
    /// Voxel side length in meters
    pub voxel_size: f64,
    /// Minimum points per voxel before a plane fit is attempted
    pub min_points_per_voxel: usize,
    /// Planarity gate: smallest eigenvalue must be below this fraction of
    /// the middle eigenvalue
    pub planarity_ratio: f64,
}

impl Default for SurfelConfig {
    fn default() -> Self {
        Self {
            voxel_size: 1.0,
            min_points_per_voxel: 6,
            planarity_ratio: 0.1,
        }
    }
}

/// Surfel correspondence search parameters
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Neighbors fetched per surfel from the spatial index
    pub neighbors: usize,
    /// Maximum angle between surfel normals (radians)
    pub max_normal_angle: f64,
    /// Maximum point-to-plane distance, applied from both sides (meters)
    pub max_distance: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            neighbors: 10,
            max_normal_angle: 15.0_f64.to_radians(),
            max_distance: 0.3,
        }
    }
}

/// Top-level estimator configuration
#[derive(Debug, Clone)]
pub struct LioConfig {
    /// Rigid transform taking LiDAR-frame points into the IMU frame
    pub ext_lidar2imu: Isometry3<f64>,
    /// Returns closer than this are dropped (meters)
    pub min_range: f64,
    /// Returns farther than this are dropped (meters)
    pub max_range: f64,
    /// Self-occlusion box in the IMU frame; points inside are dropped
    pub blind_box: Aabb,

    /// Seconds of points collected into one sweep
    pub sweep_duration: f64,
    /// IMU sample rate (Hz)
    pub imu_rate: f64,
    /// Spacing of trajectory control points (seconds)
    pub sample_dt: f64,
    /// Temporal span of the optimization window (seconds)
    pub sliding_window_duration: f64,
    /// Local gravity magnitude (m/s²)
    pub gravity_norm: f64,

    /// Cost weight on the gyroscope rate residual
    pub gyro_noise_weight: f64,
    /// Cost weight on the accelerometer residual
    pub accel_noise_weight: f64,
    /// Cost weight on the gyroscope bias random walk
    pub gyro_walk_weight: f64,
    /// Cost weight on the accelerometer bias random walk
    pub accel_walk_weight: f64,

    /// Re-match/solve/correct cycles per sweep
    pub outer_iters: usize,
    /// Solver iterations per cycle
    pub inner_iters: usize,

    /// Stop ingesting sweeps after this many (None = run forever)
    pub max_sweeps: Option<u64>,

    pub surfel: SurfelConfig,
    pub matcher: MatcherConfig,
}

impl Default for LioConfig {
    fn default() -> Self {
        Self {
            ext_lidar2imu: Isometry3::identity(),
            min_range: 0.5,
            max_range: 100.0,
            blind_box: Aabb::new(
                Vector3::new(-0.3, -0.3, -0.3),
                Vector3::new(0.3, 0.3, 0.3),
            ),
            sweep_duration: 0.1,
            imu_rate: 100.0,
            sample_dt: 0.05,
            sliding_window_duration: 1.0,
            gravity_norm: 9.81,
            gyro_noise_weight: 100.0,
            accel_noise_weight: 100.0,
            gyro_walk_weight: 1000.0,
            accel_walk_weight: 1000.0,
            outer_iters: 2,
            inner_iters: 10,
            max_sweeps: None,
            surfel: SurfelConfig::default(),
            matcher: MatcherConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aabb_contains() {
        let aabb = Aabb::new(Vector3::new(-1.0, -1.0, -1.0), Vector3::new(1.0, 1.0, 1.0));
        assert!(aabb.contains(&Vector3::new(0.0, 0.0, 0.0)));
        assert!(aabb.contains(&Vector3::new(1.0, 1.0, 1.0)));
        assert!(!aabb.contains(&Vector3::new(1.1, 0.0, 0.0)));
        assert!(!aabb.contains(&Vector3::new(0.0, -2.0, 0.0)));
    }
}
