//! Window state types
//!
//! The estimator owns three deques (dense IMU states, sparse sample states
//! and surfels), all non-decreasing in timestamp. Sample states
//! carry the 12-dimensional correction block the solver optimizes; the
//! block is a flat array so a single parameter pointer covers all
//! correction dimensions of one control point.

use nalgebra::{UnitQuaternion, Vector3};

use crate::surfel::VoxelKey;

/// A single IMU measurement
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Timestamp in seconds, IMU clock
    pub timestamp: f64,
    /// Angular velocity (rad/s), body frame
    pub gyro: Vector3<f64>,
    /// Specific force (m/s²), body frame; gravity included
    pub accel: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        Self {
            timestamp,
            gyro,
            accel,
        }
    }
}

/// One LiDAR return with its per-point timestamp (already on the IMU clock)
#[derive(Debug, Clone, Copy)]
pub struct LidarPoint {
    pub position: Vector3<f64>,
    pub timestamp: f64,
}

impl LidarPoint {
    pub fn new(position: Vector3<f64>, timestamp: f64) -> Self {
        Self {
            position,
            timestamp,
        }
    }
}

/// A densely-spaced propagated pose, one per IMU sample.
///
/// Not directly optimized; shifted by the B-spline corrector after each
/// solve. The raw measurements ride along because both the propagation
/// recurrence and the IMU factors consume them.
#[derive(Debug, Clone)]
pub struct ImuState {
    pub timestamp: f64,
    pub pos: Vector3<f64>,
    pub rot: UnitQuaternion<f64>,
    /// Specific force measured at this state's timestamp
    pub acc: Vector3<f64>,
    /// Angular velocity measured at this state's timestamp
    pub gyr: Vector3<f64>,
}

/// Correction-block layout: `[rot(3) | pos(3) | ba(3) | bg(3)]`
pub const COR_ROT: usize = 0;
pub const COR_POS: usize = 3;
pub const COR_BA: usize = 6;
pub const COR_BG: usize = 9;
pub const COR_DIM: usize = 12;

/// A sparse trajectory control point at `sample_dt` cadence.
///
/// Carries the nominal pose, biases and gravity, plus the flat correction
/// block `cor` that the optimizer writes and the corrector absorbs back
/// into the nominal state (after which `cor` is exactly zero again).
#[derive(Debug, Clone)]
pub struct SampleState {
    pub timestamp: f64,
    pub pos: Vector3<f64>,
    pub rot: UnitQuaternion<f64>,
    /// Accelerometer bias
    pub ba: Vector3<f64>,
    /// Gyroscope bias
    pub bg: Vector3<f64>,
    /// Gravity in the world frame
    pub grav: Vector3<f64>,
    /// Solver-facing correction block (axis-angle rotation, translation,
    /// accelerometer bias, gyroscope bias)
    pub cor: [f64; COR_DIM],
}

impl SampleState {
    pub fn rot_cor(&self) -> Vector3<f64> {
        Vector3::new(self.cor[COR_ROT], self.cor[COR_ROT + 1], self.cor[COR_ROT + 2])
    }

    pub fn pos_cor(&self) -> Vector3<f64> {
        Vector3::new(self.cor[COR_POS], self.cor[COR_POS + 1], self.cor[COR_POS + 2])
    }

    pub fn ba_cor(&self) -> Vector3<f64> {
        Vector3::new(self.cor[COR_BA], self.cor[COR_BA + 1], self.cor[COR_BA + 2])
    }

    pub fn bg_cor(&self) -> Vector3<f64> {
        Vector3::new(self.cor[COR_BG], self.cor[COR_BG + 1], self.cor[COR_BG + 2])
    }

    pub fn clear_corrections(&mut self) {
        self.cor = [0.0; COR_DIM];
    }
}

/// A planar patch fit to one voxel of a motion-compensated sweep.
///
/// World-frame centroid and normal are re-baked from the local pair
/// whenever the IMU trajectory shifts; the local pair is fixed at
/// extraction time, expressed in the body frame at `timestamp`.
#[derive(Debug, Clone)]
pub struct Surfel {
    pub centroid: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub local_centroid: Vector3<f64>,
    pub local_normal: Vector3<f64>,
    /// Timestamp of the sweep point nearest the centroid
    pub timestamp: f64,
    pub voxel: VoxelKey,
}

impl Surfel {
    /// Re-bake the world-frame centroid and normal from the body pose at
    /// this surfel's timestamp.
    pub fn update_pose(&mut self, pos: &Vector3<f64>, rot: &UnitQuaternion<f64>) {
        self.centroid = rot * self.local_centroid + pos;
        self.normal = rot * self.local_normal;
    }
}
