//! The estimator pipeline
//!
//! Single-threaded and synchronous, clocked by point arrival. `add_imu_data`
//! only buffers; `add_lidar_scan` buffers, then runs at most one full sweep
//! of the pipeline: head-sync, prediction, sweep assembly, undistortion,
//! surfel extraction, and the match/solve/correct outer loop, followed by
//! window trimming and publication.

use std::collections::VecDeque;

use nalgebra::Point3;

use crate::config::LioConfig;
use crate::corrector;
use crate::matcher::KnnSurfelMatcher;
use crate::optimization::optimize_window;
use crate::predictor;
use crate::publish::{NullPublisher, Publisher};
use crate::state::{ImuSample, ImuState, LidarPoint, SampleState, Surfel};
use crate::surfel::{extract_surfels, GlobalVoxelMap};
use crate::sweep;
use crate::window;

pub struct LioEstimator {
    config: LioConfig,

    imu_buff: VecDeque<ImuSample>,
    points_buff: VecDeque<LidarPoint>,

    imu_states: VecDeque<ImuState>,
    sample_states: VecDeque<SampleState>,
    surfels: VecDeque<Surfel>,
    global_map: GlobalVoxelMap,

    publisher: Box<dyn Publisher>,

    sync_done: bool,
    window_initialized: bool,
    sweep_id: u64,
}

impl LioEstimator {
    pub fn new(config: LioConfig) -> Self {
        Self::with_publisher(config, Box::new(NullPublisher))
    }

    pub fn with_publisher(config: LioConfig, publisher: Box<dyn Publisher>) -> Self {
        Self {
            config,
            imu_buff: VecDeque::new(),
            points_buff: VecDeque::new(),
            imu_states: VecDeque::new(),
            sample_states: VecDeque::new(),
            surfels: VecDeque::new(),
            global_map: GlobalVoxelMap::default(),
            publisher,
            sync_done: false,
            window_initialized: false,
            sweep_id: 0,
        }
    }

    /// Buffer one IMU sample. Timestamps must be non-decreasing.
    pub fn add_imu_data(&mut self, sample: ImuSample) {
        if let Some(back) = self.imu_buff.back() {
            assert!(
                sample.timestamp >= back.timestamp,
                "IMU timestamps must be non-decreasing: {} after {}",
                sample.timestamp,
                back.timestamp
            );
        }
        self.imu_buff.push_back(sample);
    }

    /// Buffer a point cloud (per-point timestamps on the IMU clock) and run
    /// the pipeline if a full sweep is available.
    pub fn add_lidar_scan(&mut self, cloud: &[LidarPoint]) {
        if let Some(max) = self.config.max_sweeps {
            if self.sweep_id >= max {
                return;
            }
        }

        // Prefilter on ingest: extrinsic transform, range gate, blind box
        for pt in cloud {
            let p = (self.config.ext_lidar2imu * Point3::from(pt.position)).coords;
            if let Some(back) = self.points_buff.back() {
                assert!(
                    pt.timestamp >= back.timestamp,
                    "point timestamps must be non-decreasing: {} after {}",
                    pt.timestamp,
                    back.timestamp
                );
            }
            let range = p.norm();
            if range < self.config.min_range
                || range > self.config.max_range
                || self.config.blind_box.contains(&p)
            {
                continue;
            }
            self.points_buff.push_back(LidarPoint::new(p, pt.timestamp));
        }

        if !self.sync_heading_msgs() {
            return;
        }

        // Wait until both streams cover the whole sweep interval
        let Some(front) = self.points_buff.front() else {
            return;
        };
        let sweep_endtime = front.timestamp + self.config.sweep_duration;
        if self.points_buff.back().unwrap().timestamp < sweep_endtime
            || self.imu_buff.is_empty()
            || self.imu_buff.back().unwrap().timestamp < sweep_endtime
        {
            tracing::trace!("waiting to construct a sweep");
            return;
        }
        if !self.window_initialized && self.imu_buff.len() < 2 {
            tracing::trace!("waiting for IMU samples to initialize the window");
            return;
        }

        self.run_sweep(sweep_endtime);
    }

    /// One-shot head alignment: drop leading samples until both buffer
    /// fronts coincide, then latch so later arrivals are never trimmed.
    fn sync_heading_msgs(&mut self) -> bool {
        if self.sync_done {
            return true;
        }
        if self.imu_buff.is_empty() || self.points_buff.is_empty() {
            return false;
        }
        if self.imu_buff.back().unwrap().timestamp < self.points_buff.front().unwrap().timestamp {
            tracing::debug!("waiting for imu messages to cover the first point");
            return false;
        }

        while self.imu_buff.front().unwrap().timestamp
            < self.points_buff.front().unwrap().timestamp
        {
            self.imu_buff.pop_front();
            assert!(!self.imu_buff.is_empty());
        }
        while self.points_buff.front().unwrap().timestamp
            < self.imu_buff.front().unwrap().timestamp
        {
            self.points_buff.pop_front();
            assert!(!self.points_buff.is_empty());
        }

        self.sync_done = true;
        true
    }

    fn run_sweep(&mut self, sweep_endtime: f64) {
        if !self.window_initialized {
            predictor::initialize_window(
                &mut self.imu_buff,
                &mut self.imu_states,
                &mut self.sample_states,
                &self.config,
            );
            self.window_initialized = true;
        }
        predictor::predict_states(
            &mut self.imu_buff,
            &mut self.imu_states,
            &mut self.sample_states,
            sweep_endtime,
            &self.config,
        );
        // Clamp to the newest sample so every sweep point can be bracketed
        // during optimization
        let sweep_endtime = self.sample_states.back().unwrap().timestamp;

        let sweep = sweep::build_sweep(&mut self.points_buff, sweep_endtime);
        if sweep.is_empty() {
            tracing::debug!(sweep_endtime, "no points below the sweep end");
            return;
        }
        tracing::info!(
            sweep = self.sweep_id,
            points = sweep.len(),
            first = sweep.first().unwrap().timestamp,
            last = sweep.last().unwrap().timestamp,
            sweep_endtime,
            "built sweep"
        );

        let sweep_undistorted = sweep::undistort_sweep(&sweep, &self.imu_states);

        let surfels_sweep =
            extract_surfels(&sweep_undistorted, &self.imu_states, &self.config.surfel);
        tracing::info!(surfels = surfels_sweep.len(), "extracted surfels");
        for s in &surfels_sweep {
            self.global_map.insert(s.voxel, s.centroid);
        }
        self.surfels.extend(surfels_sweep);
        sweep::update_surfel_poses(&self.imu_states, &mut self.surfels);

        for iter in 0..self.config.outer_iters {
            let matcher = KnnSurfelMatcher::build_index(&self.surfels);
            let corrs = matcher.match_surfels(&self.surfels, &self.config.matcher);
            tracing::debug!(iter, correspondences = corrs.len(), "matched surfels");

            optimize_window(
                &mut self.sample_states,
                &self.imu_states,
                &self.surfels,
                &corrs,
                &self.config,
            );

            corrector::update_imu_poses(&self.sample_states, &mut self.imu_states);
            sweep::update_surfel_poses(&self.imu_states, &mut self.surfels);
            corrector::update_sample_states(&mut self.sample_states);

            for s in &self.sample_states {
                tracing::trace!(
                    t = s.timestamp,
                    pos = ?s.pos,
                    bg = ?s.bg,
                    ba = ?s.ba,
                    "sample state"
                );
            }
        }

        window::shrink_to_fit(
            &mut self.sample_states,
            &mut self.imu_states,
            &mut self.surfels,
            self.config.sliding_window_duration,
        );

        self.publisher.surfels(&self.surfels);
        if let Some(front) = self.points_buff.front() {
            let stamp = front.timestamp;
            self.publisher.scan_in_imu_frame(&self.points_buff, stamp);
        }
        let newest = self.sample_states.back().unwrap();
        self.publisher
            .rig_pose(newest.timestamp, &newest.pos, &newest.rot);

        self.sweep_id += 1;
    }

    pub fn config(&self) -> &LioConfig {
        &self.config
    }

    pub fn sample_states(&self) -> &VecDeque<SampleState> {
        &self.sample_states
    }

    pub fn imu_states(&self) -> &VecDeque<ImuState> {
        &self.imu_states
    }

    pub fn surfels(&self) -> &VecDeque<Surfel> {
        &self.surfels
    }

    pub fn global_map(&self) -> &GlobalVoxelMap {
        &self.global_map
    }

    pub fn buffered_points(&self) -> &VecDeque<LidarPoint> {
        &self.points_buff
    }

    pub fn buffered_imu(&self) -> &VecDeque<ImuSample> {
        &self.imu_buff
    }

    /// Sweeps fully processed so far
    pub fn sweep_count(&self) -> u64 {
        self.sweep_id
    }

    /// The newest sample state's pose, if the window is initialized
    pub fn latest_pose(&self) -> Option<(f64, nalgebra::Vector3<f64>, nalgebra::UnitQuaternion<f64>)> {
        self.sample_states
            .back()
            .map(|s| (s.timestamp, s.pos, s.rot))
    }
}
