//! Publication hooks
//!
//! The estimator reports its outputs through this trait at the end of each
//! sweep; transports and visualization sinks live with the caller. All
//! methods default to no-ops so a consumer can pick what it needs.

use std::collections::VecDeque;

use nalgebra::{UnitQuaternion, Vector3};

use crate::state::{LidarPoint, Surfel};

pub trait Publisher {
    /// The current window's surfel set
    fn surfels(&mut self, _surfels: &VecDeque<Surfel>) {}

    /// The raw buffered point cloud, stamped to the latest sweep start
    fn scan_in_imu_frame(&mut self, _points: &VecDeque<LidarPoint>, _stamp: f64) {}

    /// The rig pose (world -> imu_link) at the newest sample timestamp
    fn rig_pose(&mut self, _timestamp: f64, _pos: &Vector3<f64>, _rot: &UnitQuaternion<f64>) {}
}

/// Default publisher: discards everything.
pub struct NullPublisher;

impl Publisher for NullPublisher {}
