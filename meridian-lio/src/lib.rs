//! meridian-lio: tightly-coupled LiDAR-inertial odometry
//!
//! A sliding-window batch estimator for a rotating LiDAR plus IMU rig. The
//! pipeline is clocked by point arrival: sweeps are assembled from the point
//! buffer, the IMU trajectory is propagated forward, planar surfels are
//! extracted from the motion-compensated sweep and matched across time, and
//! a joint nonlinear least-squares problem over sparse trajectory control
//! points ties everything together. Solved corrections are pushed back into
//! the dense IMU trajectory through a cubic B-spline before the window is
//! trimmed.

pub mod config;
pub mod corrector;
pub mod estimator;
pub mod histogram;
pub mod matcher;
pub mod optimization;
pub mod predictor;
pub mod publish;
pub mod residuals;
pub mod state;
pub mod surfel;
pub mod sweep;
pub mod window;

pub use config::{Aabb, LioConfig, MatcherConfig, SurfelConfig};
pub use estimator::LioEstimator;
pub use publish::Publisher;
pub use state::{ImuSample, ImuState, LidarPoint, SampleState, Surfel};
