//! IMU propagation and sample-state extension
//!
//! Grows the dense IMU-state deque and the sparse sample-state deque until
//! they cover a target end time, integrating forward with the biases and
//! gravity of the newest sample state.

use std::collections::VecDeque;

use nalgebra::{UnitQuaternion, Vector3};

use crate::config::LioConfig;
use crate::state::{ImuSample, ImuState, SampleState, COR_DIM};
use crate::sweep::imu_pose_at;

/// Tolerance for the most-recent sample landing exactly on the target time.
pub(crate) const TIME_EPS: f64 = 1e-9;

/// One-time window initialization from the first two IMU samples.
///
/// State 0 anchors the world frame: identity rotation, zero position.
/// State 1 takes the rotation integrated from the averaged gyro rates.
/// The first sample state is created at state 0's timestamp with zero
/// biases and gravity opposite the measured specific force.
pub(crate) fn initialize_window(
    imu_buff: &mut VecDeque<ImuSample>,
    imu_states: &mut VecDeque<ImuState>,
    sample_states: &mut VecDeque<SampleState>,
    config: &LioConfig,
) {
    assert!(imu_buff.len() >= 2, "window init needs two IMU samples");
    let dt = 1.0 / config.imu_rate;

    for i in 0..2 {
        let msg = imu_buff.pop_front().unwrap();
        let rot = if i == 0 {
            UnitQuaternion::identity()
        } else {
            let prev = imu_states.back().unwrap();
            UnitQuaternion::from_scaled_axis((prev.gyr + msg.gyro) / 2.0 * dt)
        };
        imu_states.push_back(ImuState {
            timestamp: msg.timestamp,
            pos: Vector3::zeros(),
            rot,
            acc: msg.accel,
            gyr: msg.gyro,
        });
    }

    let first = imu_states.front().unwrap();
    sample_states.push_back(SampleState {
        timestamp: first.timestamp,
        pos: first.pos,
        rot: first.rot,
        ba: Vector3::zeros(),
        bg: Vector3::zeros(),
        grav: -config.gravity_norm * first.acc.normalize(),
        cor: [0.0; COR_DIM],
    });
}

/// Extend IMU states and sample states to cover `end_time`.
///
/// The position recurrence is a two-step central integrator:
/// `pos_i = 2 pos_{i-1} - pos_{i-2} + (R_{i-2} (acc_{i-2} - ba) + g) dt²`,
/// which needs the two seed states from initialization.
pub(crate) fn predict_states(
    imu_buff: &mut VecDeque<ImuSample>,
    imu_states: &mut VecDeque<ImuState>,
    sample_states: &mut VecDeque<SampleState>,
    end_time: f64,
    config: &LioConfig,
) {
    let dt = 1.0 / config.imu_rate;
    let newest = sample_states.back().unwrap();
    let ba = newest.ba;
    let bg = newest.bg;
    let grav = newest.grav;

    while let Some(msg) = imu_buff.pop_front() {
        let n = imu_states.len();
        debug_assert!(n >= 2);
        let prev = &imu_states[n - 1];
        let prev2 = &imu_states[n - 2];

        let mut rot = prev.rot * UnitQuaternion::from_scaled_axis(((prev.gyr + msg.gyro) / 2.0 - bg) * dt);
        rot.renormalize();
        let pos = 2.0 * prev.pos - prev2.pos + (prev2.rot * (prev2.acc - ba) + grav) * dt * dt;

        let timestamp = msg.timestamp;
        imu_states.push_back(ImuState {
            timestamp,
            pos,
            rot,
            acc: msg.accel,
            gyr: msg.gyro,
        });

        if timestamp >= end_time {
            // enough states to bracket every sample up to end_time
            break;
        }
    }

    let oldest_new = sample_states.back().unwrap().timestamp + config.sample_dt;
    let old_size = sample_states.len();
    let mut timestamp = oldest_new;
    while timestamp <= end_time + TIME_EPS {
        let (pos, rot) = imu_pose_at(imu_states, timestamp);
        sample_states.push_back(SampleState {
            timestamp,
            pos,
            rot,
            ba,
            bg,
            grav,
            cor: [0.0; COR_DIM],
        });
        timestamp += config.sample_dt;
    }

    tracing::debug!(
        added = sample_states.len() - old_size,
        newest = sample_states.back().unwrap().timestamp,
        "extended sample states"
    );
}
