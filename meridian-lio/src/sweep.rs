//! Sweep assembly and motion compensation
//!
//! A sweep is the set of buffered points below the sweep end time. Each
//! point is rewritten into the common reference frame by interpolating the
//! dense IMU trajectory at the point's timestamp (linear position, slerp
//! rotation). A point outside the IMU trajectory support is an invariant
//! violation, not a recoverable condition.

use std::collections::VecDeque;

use nalgebra::{UnitQuaternion, Vector3};

use crate::state::{ImuState, LidarPoint, Surfel};

/// Interpolate the IMU trajectory at `t`.
///
/// Requires `imu_states.front().t <= t <= imu_states.back().t`; equality at
/// the front resolves to the first bracket with zero fraction.
pub(crate) fn imu_pose_at(
    imu_states: &VecDeque<ImuState>,
    t: f64,
) -> (Vector3<f64>, UnitQuaternion<f64>) {
    let mut idx = imu_states.partition_point(|s| s.timestamp < t);
    assert!(
        idx < imu_states.len(),
        "timestamp {} past IMU trajectory end {}",
        t,
        imu_states.back().map(|s| s.timestamp).unwrap_or(f64::NAN)
    );
    if idx == 0 {
        assert!(
            t >= imu_states[0].timestamp,
            "timestamp {} before IMU trajectory start {}",
            t,
            imu_states[0].timestamp
        );
        idx = 1;
        assert!(idx < imu_states.len());
    }

    let left = &imu_states[idx - 1];
    let right = &imu_states[idx];
    let factor = (t - left.timestamp) / (right.timestamp - left.timestamp);
    debug_assert!((-1e-12..=1.0 + 1e-12).contains(&factor));

    let pos = left.pos * (1.0 - factor) + right.pos * factor;
    let rot = left.rot.slerp(&right.rot, factor);
    (pos, rot)
}

/// Drain all buffered points with `t < sweep_endtime` into a sweep.
pub(crate) fn build_sweep(
    points_buff: &mut VecDeque<LidarPoint>,
    sweep_endtime: f64,
) -> Vec<LidarPoint> {
    let mut sweep = Vec::new();
    while points_buff
        .front()
        .is_some_and(|p| p.timestamp < sweep_endtime)
    {
        sweep.push(points_buff.pop_front().unwrap());
    }
    sweep
}

/// Rewrite each point into the common reference frame using the pose at
/// its timestamp.
pub(crate) fn undistort_sweep(
    sweep: &[LidarPoint],
    imu_states: &VecDeque<ImuState>,
) -> Vec<LidarPoint> {
    sweep
        .iter()
        .map(|pt| {
            let (pos, rot) = imu_pose_at(imu_states, pt.timestamp);
            LidarPoint::new(rot * pt.position + pos, pt.timestamp)
        })
        .collect()
}

/// Re-bake every surfel's world centroid/normal from the current IMU
/// trajectory. Called whenever the trajectory shifts.
pub(crate) fn update_surfel_poses(imu_states: &VecDeque<ImuState>, surfels: &mut VecDeque<Surfel>) {
    for surfel in surfels.iter_mut() {
        let (pos, rot) = imu_pose_at(imu_states, surfel.timestamp);
        surfel.update_pose(&pos, &rot);
    }
}
