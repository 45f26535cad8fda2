//! Window problem assembly and solve
//!
//! Lays the window's correction blocks out as one flat parameter vector
//! (12 per sample state), assembles surfel and IMU factors with their
//! sparsity entries, and runs the sparse Levenberg-Marquardt solver. The
//! first sample's translation is held constant to fix the gauge; rotation
//! stays free because gravity and the surfels observe it.

use std::collections::VecDeque;

use nalgebra::DVector;

use meridian_solver::math3d::Vec3;
use meridian_solver::{Jet, SparseLevenbergMarquardt};

use crate::config::LioConfig;
use crate::histogram::Histogram;
use crate::matcher::SurfelCorrespondence;
use crate::residuals::{cauchy_weight, ImuFactor, PoseCor, SurfelFactor};
use crate::state::{ImuState, SampleState, Surfel, COR_DIM, COR_POS, COR_ROT};

/// Robust loss scale for surfel residual blocks (meters)
const CAUCHY_SCALE: f64 = 0.4;
/// LiDAR factors touch only the pose spans of each block
const POSE_DIMS: usize = 6;

/// Build all factors, solve, and write the optimized corrections back into
/// the sample states' correction blocks.
pub(crate) fn optimize_window(
    sample_states: &mut VecDeque<SampleState>,
    imu_states: &VecDeque<ImuState>,
    surfels: &VecDeque<Surfel>,
    corrs: &[SurfelCorrespondence],
    config: &LioConfig,
) {
    if sample_states.len() < 2 {
        return;
    }
    let n_samples = sample_states.len();

    // Surfel binary factors. A bracket touching the window boundary means
    // the surfel is not strictly inside the sample span yet; skip the
    // correspondence rather than die.
    let mut lidar_factors = Vec::new();
    for corr in corrs {
        let s1 = &surfels[corr.earlier];
        let s2 = &surfels[corr.later];
        debug_assert!(s1.timestamp < s2.timestamp);

        let r1 = sample_states.partition_point(|s| s.timestamp <= s1.timestamp);
        let r2 = sample_states.partition_point(|s| s.timestamp <= s2.timestamp);
        if r1 == 0 || r1 == n_samples || r2 == 0 || r2 == n_samples {
            continue;
        }
        lidar_factors.push(SurfelFactor::new(
            s1,
            s2,
            sample_states,
            r1 - 1,
            r1,
            r2 - 1,
            r2,
        ));
    }

    // IMU ternary factors over consecutive triples inside the sample span
    let front_t = sample_states.front().unwrap().timestamp;
    let back_t = sample_states.back().unwrap().timestamp;
    let grav = sample_states.back().unwrap().grav;
    let weights = [
        config.gyro_noise_weight,
        config.accel_noise_weight,
        config.gyro_walk_weight,
        config.accel_walk_weight,
    ];
    let imu_dt = 1.0 / config.imu_rate;

    let mut imu_factors = Vec::new();
    for i in 0..imu_states.len().saturating_sub(2) {
        let i1 = &imu_states[i];
        let i2 = &imu_states[i + 1];
        let i3 = &imu_states[i + 2];
        if i1.timestamp < front_t {
            continue;
        }
        if i3.timestamp > back_t {
            break;
        }

        let idx = sample_states.partition_point(|s| s.timestamp <= i1.timestamp);
        debug_assert!(idx >= 1 && idx < n_samples);
        let sp3 = if idx == n_samples - 1 {
            None
        } else {
            Some(idx + 1)
        };
        imu_factors.push(ImuFactor::new(
            i1,
            i2,
            i3,
            sample_states,
            idx - 1,
            idx,
            sp3,
            grav,
            imu_dt,
            weights,
        ));
    }

    let n_lidar_rows = lidar_factors.len() * 3;
    let n_rows = n_lidar_rows + imu_factors.len() * 12;
    if n_rows == 0 {
        tracing::debug!("nothing to optimize in this window");
        return;
    }
    let n_params = n_samples * COR_DIM;

    // Sparsity entries, row-major: within a row the blocks are ascending
    // sample indices, so columns ascend too.
    let mut entries = Vec::new();
    for (fi, f) in lidar_factors.iter().enumerate() {
        for r in 0..3 {
            let row = fi * 3 + r;
            for b in 0..f.n_blocks {
                let base = f.blocks[b] * COR_DIM;
                for d in 0..POSE_DIMS {
                    entries.push((row, base + d));
                }
            }
        }
    }
    for (fi, f) in imu_factors.iter().enumerate() {
        for r in 0..12 {
            let row = n_lidar_rows + fi * 12 + r;
            for b in 0..f.n_blocks {
                let base = f.blocks[b] * COR_DIM;
                for d in 0..COR_DIM {
                    entries.push((row, base + d));
                }
            }
        }
    }

    let mut initial = DVector::zeros(n_params);
    for (si, s) in sample_states.iter().enumerate() {
        for d in 0..COR_DIM {
            initial[si * COR_DIM + d] = s.cor[d];
        }
    }

    log_residual_stats(&lidar_factors, &imu_factors, &initial, "pre-solve");

    let mut solver = SparseLevenbergMarquardt::new(n_rows, n_params, &entries)
        .with_max_iterations(config.inner_iters)
        .with_constant_params(&[COR_POS, COR_POS + 1, COR_POS + 2]);

    let mut final_error = f64::NAN;
    let mut iterations = 0;
    let mut converged = false;
    let solved = solver.solve(
        initial,
        |params, residuals, jacobian| {
            let mut cursor = 0;
            for (fi, f) in lidar_factors.iter().enumerate() {
                eval_lidar_factor(f, params, fi * 3, residuals, jacobian, &mut cursor);
            }
            for (fi, f) in imu_factors.iter().enumerate() {
                eval_imu_factor(
                    f,
                    params,
                    n_lidar_rows + fi * 12,
                    residuals,
                    jacobian,
                    &mut cursor,
                );
            }
        },
        |iter, res, _| {
            iterations = iter + 1;
            final_error = res.error;
            converged = res.converged;
            tracing::debug!(
                iter,
                error = res.error,
                lambda = res.lambda,
                step = res.step_norm,
                "solver iteration"
            );
        },
    );

    // Non-convergence is logged, never fatal: whatever correction the
    // solver produced still goes to the corrector.
    tracing::info!(
        surfel_factors = lidar_factors.len(),
        imu_factors = imu_factors.len(),
        iterations,
        final_error,
        converged,
        "window solve"
    );

    for (si, s) in sample_states.iter_mut().enumerate() {
        for d in 0..COR_DIM {
            s.cor[d] = solved[si * COR_DIM + d];
        }
    }

    log_residual_stats(&lidar_factors, &imu_factors, &solved, "post-solve");
}

/// Pose-span corrections of one block as plain f64, from the flat params
fn pose_cor_f64(params: &DVector<f64>, sample: usize) -> PoseCor<f64> {
    let base = sample * COR_DIM;
    PoseCor {
        rot: Vec3::new(
            params[base + COR_ROT],
            params[base + COR_ROT + 1],
            params[base + COR_ROT + 2],
        ),
        pos: Vec3::new(
            params[base + COR_POS],
            params[base + COR_POS + 1],
            params[base + COR_POS + 2],
        ),
    }
}

fn eval_lidar_factor(
    f: &SurfelFactor,
    params: &DVector<f64>,
    row_base: usize,
    residuals: &mut [f64],
    jacobian: &mut [f64],
    cursor: &mut usize,
) {
    match f.n_blocks {
        2 => eval_lidar_sized::<12>(f, params, row_base, residuals, jacobian, cursor),
        3 => eval_lidar_sized::<18>(f, params, row_base, residuals, jacobian, cursor),
        4 => eval_lidar_sized::<24>(f, params, row_base, residuals, jacobian, cursor),
        _ => unreachable!("surfel factor with {} blocks", f.n_blocks),
    }
}

fn eval_lidar_sized<const N: usize>(
    f: &SurfelFactor,
    params: &DVector<f64>,
    row_base: usize,
    residuals: &mut [f64],
    jacobian: &mut [f64],
    cursor: &mut usize,
) {
    let cors: Vec<PoseCor<Jet<N>>> = (0..f.n_blocks)
        .map(|b| {
            let base = f.blocks[b] * COR_DIM;
            PoseCor {
                rot: Vec3::new(
                    Jet::variable(params[base + COR_ROT], b * POSE_DIMS),
                    Jet::variable(params[base + COR_ROT + 1], b * POSE_DIMS + 1),
                    Jet::variable(params[base + COR_ROT + 2], b * POSE_DIMS + 2),
                ),
                pos: Vec3::new(
                    Jet::variable(params[base + COR_POS], b * POSE_DIMS + 3),
                    Jet::variable(params[base + COR_POS + 1], b * POSE_DIMS + 4),
                    Jet::variable(params[base + COR_POS + 2], b * POSE_DIMS + 5),
                ),
            }
        })
        .collect();

    let r = f.evaluate(&cors);

    let squared_norm: f64 = r.iter().map(|j| j.value * j.value).sum();
    let w = cauchy_weight(CAUCHY_SCALE, squared_norm);

    for row in 0..3 {
        residuals[row_base + row] = w * r[row].value;
        for b in 0..f.n_blocks {
            for d in 0..POSE_DIMS {
                jacobian[*cursor] = w * r[row].derivs[b * POSE_DIMS + d];
                *cursor += 1;
            }
        }
    }
}

fn eval_imu_factor(
    f: &ImuFactor,
    params: &DVector<f64>,
    row_base: usize,
    residuals: &mut [f64],
    jacobian: &mut [f64],
    cursor: &mut usize,
) {
    match f.n_blocks {
        2 => eval_imu_sized::<24>(f, params, row_base, residuals, jacobian, cursor),
        3 => eval_imu_sized::<36>(f, params, row_base, residuals, jacobian, cursor),
        _ => unreachable!("imu factor with {} blocks", f.n_blocks),
    }
}

fn eval_imu_sized<const N: usize>(
    f: &ImuFactor,
    params: &DVector<f64>,
    row_base: usize,
    residuals: &mut [f64],
    jacobian: &mut [f64],
    cursor: &mut usize,
) {
    let blocks: Vec<[Jet<N>; COR_DIM]> = (0..f.n_blocks)
        .map(|b| {
            let base = f.blocks[b] * COR_DIM;
            std::array::from_fn(|d| Jet::variable(params[base + d], b * COR_DIM + d))
        })
        .collect();
    let cor_slices: Vec<&[Jet<N>]> = blocks.iter().map(|a| &a[..]).collect();

    let r = f.evaluate(&cor_slices);

    for row in 0..12 {
        residuals[row_base + row] = r[row].value;
        for b in 0..f.n_blocks {
            for d in 0..COR_DIM {
                jacobian[*cursor] = r[row].derivs[b * COR_DIM + d];
                *cursor += 1;
            }
        }
    }
}

/// Evaluate all factors in plain f64 at `params` and log the residual
/// distribution per family.
fn log_residual_stats(
    lidar_factors: &[SurfelFactor],
    imu_factors: &[ImuFactor],
    params: &DVector<f64>,
    stage: &str,
) {
    let mut cost = 0.0;

    if !lidar_factors.is_empty() {
        let mut hist = Histogram::default();
        for f in lidar_factors {
            let cors: Vec<PoseCor<f64>> = (0..f.n_blocks)
                .map(|b| pose_cor_f64(params, f.blocks[b]))
                .collect();
            let r = f.evaluate(&cors);
            let squared_norm: f64 = r.iter().map(|v| v * v).sum();
            let w = cauchy_weight(CAUCHY_SCALE, squared_norm);
            for v in r {
                hist.add(w * v);
                cost += 0.5 * (w * v) * (w * v);
            }
        }
        tracing::info!(stage, dist = %hist.summary(10), "surfel residuals");
    }

    if !imu_factors.is_empty() {
        let mut hists: [Histogram; 4] = Default::default();
        let part_names = ["gyro", "acc", "gyro_bias", "acc_bias"];
        for f in imu_factors {
            let blocks: Vec<[f64; COR_DIM]> = (0..f.n_blocks)
                .map(|b| {
                    let base = f.blocks[b] * COR_DIM;
                    std::array::from_fn(|d| params[base + d])
                })
                .collect();
            let cor_slices: Vec<&[f64]> = blocks.iter().map(|a| &a[..]).collect();
            let r = f.evaluate(&cor_slices);
            for part in 0..4 {
                let norm = (r[part * 3] * r[part * 3]
                    + r[part * 3 + 1] * r[part * 3 + 1]
                    + r[part * 3 + 2] * r[part * 3 + 2])
                    .sqrt();
                hists[part].add(norm);
                cost += 0.5 * norm * norm;
            }
        }
        for (name, hist) in part_names.into_iter().zip(&hists) {
            tracing::info!(stage, part = name, dist = %hist.summary(10), "imu residuals");
        }
    }

    tracing::debug!(stage, cost, "window cost");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surfel::VoxelKey;
    use nalgebra::{UnitQuaternion, Vector3};

    fn static_window(
        n_samples: usize,
        sample_dt: f64,
        imu_rate: f64,
    ) -> (VecDeque<SampleState>, VecDeque<ImuState>) {
        let samples: VecDeque<SampleState> = (0..n_samples)
            .map(|i| SampleState {
                timestamp: i as f64 * sample_dt,
                pos: Vector3::zeros(),
                rot: UnitQuaternion::identity(),
                ba: Vector3::zeros(),
                bg: Vector3::zeros(),
                grav: Vector3::new(0.0, 0.0, -9.81),
                cor: [0.0; COR_DIM],
            })
            .collect();

        let span = (n_samples - 1) as f64 * sample_dt;
        let n_imu = (span * imu_rate) as usize + 1;
        let imu: VecDeque<ImuState> = (0..n_imu)
            .map(|i| ImuState {
                timestamp: i as f64 / imu_rate,
                pos: Vector3::zeros(),
                rot: UnitQuaternion::identity(),
                acc: Vector3::new(0.0, 0.0, 9.81),
                gyr: Vector3::zeros(),
            })
            .collect();
        (samples, imu)
    }

    fn surfel(centroid: Vector3<f64>, t: f64) -> Surfel {
        Surfel {
            centroid,
            normal: Vector3::z(),
            local_centroid: centroid,
            local_normal: Vector3::z(),
            timestamp: t,
            voxel: VoxelKey::new(0, 0, 0),
        }
    }

    #[test]
    fn test_consistent_window_keeps_corrections_near_zero() {
        let config = LioConfig::default();
        let (mut samples, imu) = static_window(3, 0.05, 100.0);

        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.3, 0.2, 1.0), 0.02),
            surfel(Vector3::new(0.35, 0.22, 1.0), 0.07),
        ]
        .into();
        let corrs = vec![SurfelCorrespondence {
            earlier: 0,
            later: 1,
        }];

        optimize_window(&mut samples, &imu, &surfels, &corrs, &config);

        for s in &samples {
            assert!(
                s.cor.iter().all(|v| v.abs() < 1e-6),
                "corrections moved on perfect data: {:?}",
                s.cor
            );
        }
    }

    #[test]
    fn test_first_sample_translation_pinned() {
        let config = LioConfig::default();
        let (mut samples, imu) = static_window(3, 0.05, 100.0);

        // Inconsistent planes pull on the trajectory
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.3, 0.2, 1.0), 0.02),
            surfel(Vector3::new(0.3, 0.2, 1.1), 0.07),
        ]
        .into();
        let corrs = vec![SurfelCorrespondence {
            earlier: 0,
            later: 1,
        }];

        optimize_window(&mut samples, &imu, &surfels, &corrs, &config);

        // Translation of the first sample is bit-identical to its pre-solve
        // value; the solver was free to move everything else.
        assert_eq!(samples[0].cor[COR_POS].to_bits(), 0.0_f64.to_bits());
        assert_eq!(samples[0].cor[COR_POS + 1].to_bits(), 0.0_f64.to_bits());
        assert_eq!(samples[0].cor[COR_POS + 2].to_bits(), 0.0_f64.to_bits());
    }

    #[test]
    fn test_boundary_correspondences_skipped() {
        let config = LioConfig::default();
        let (mut samples, imu) = static_window(3, 0.05, 100.0);

        // Later surfel timestamp equals the window back: upper bound runs
        // off the deque, correspondence must be skipped without panicking.
        let surfels: VecDeque<Surfel> = vec![
            surfel(Vector3::new(0.3, 0.2, 1.0), 0.02),
            surfel(Vector3::new(0.3, 0.2, 1.0), 0.10),
        ]
        .into();
        let corrs = vec![SurfelCorrespondence {
            earlier: 0,
            later: 1,
        }];

        optimize_window(&mut samples, &imu, &surfels, &corrs, &config);
    }

    #[test]
    fn test_surfel_on_sample_timestamp_routes_adjacent() {
        use crate::residuals::SurfelTopology;

        let (samples, _) = static_window(4, 0.05, 100.0);

        // Earlier surfel exactly on the second sample: the upper bound puts
        // its bracket at (1, 2); a later surfel in the following interval
        // shares sample 2, so the factor is Adjacent.
        let s1 = surfel(Vector3::new(0.3, 0.2, 1.0), samples[1].timestamp);
        let s2 = surfel(Vector3::new(0.3, 0.2, 1.0), 0.12);

        let r1 = samples.partition_point(|s| s.timestamp <= s1.timestamp);
        let r2 = samples.partition_point(|s| s.timestamp <= s2.timestamp);
        assert_eq!((r1, r2), (2, 3));

        let f = SurfelFactor::new(&s1, &s2, &samples, r1 - 1, r1, r2 - 1, r2);
        assert_eq!(f.topology, SurfelTopology::Adjacent);
    }

    #[test]
    fn test_empty_problem_is_a_noop() {
        let config = LioConfig::default();
        let (mut samples, _) = static_window(3, 0.05, 100.0);
        let imu = VecDeque::new();
        let surfels = VecDeque::new();

        optimize_window(&mut samples, &imu, &surfels, &[], &config);
        for s in &samples {
            assert!(s.cor.iter().all(|v| *v == 0.0));
        }
    }
}
