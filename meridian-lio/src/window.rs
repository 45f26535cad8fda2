//! Sliding-window trimming
//!
//! Timestamp order across the deque fronts: sample <= imu <= surfel.

use std::collections::VecDeque;

use crate::state::{ImuState, SampleState, Surfel};

/// Drop the oldest sample states until the span fits the window, then drop
/// IMU states older than the oldest sample, then surfels older than the
/// oldest IMU state.
pub(crate) fn shrink_to_fit(
    sample_states: &mut VecDeque<SampleState>,
    imu_states: &mut VecDeque<ImuState>,
    surfels: &mut VecDeque<Surfel>,
    window_duration: f64,
) {
    let span = |samples: &VecDeque<SampleState>| {
        samples.back().unwrap().timestamp - samples.front().unwrap().timestamp
    };
    if sample_states.is_empty() || span(sample_states) <= window_duration {
        return;
    }

    while span(sample_states) > window_duration {
        sample_states.pop_front();
    }
    let oldest_sample = sample_states.front().unwrap().timestamp;
    while imu_states
        .front()
        .is_some_and(|s| s.timestamp < oldest_sample)
    {
        imu_states.pop_front();
    }
    let oldest_imu = imu_states.front().map(|s| s.timestamp);
    while let (Some(surfel), Some(oldest_imu)) = (surfels.front(), oldest_imu) {
        if surfel.timestamp >= oldest_imu {
            break;
        }
        surfels.pop_front();
    }
}
