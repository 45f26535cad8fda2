//! Correction push-back
//!
//! The solver produces corrections only at the sparse sample timestamps.
//! Two cubic B-spline interpolators (axis-angle rotation and translation)
//! carry them onto every dense IMU state inside the sample span; states
//! before the first or past the last corrected index are extended by
//! preserving their original relative transform. Sample states absorb
//! their own corrections by direct composition, after which every
//! correction block is exactly zero again.

use std::collections::VecDeque;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::state::{ImuState, SampleState};

const SUPPORT_EPS: f64 = 1e-9;

/// Interpolating cubic B-spline through `(knot, value)` pairs with natural
/// end conditions. Defined on the full knot span; `interp` returns `None`
/// outside it.
pub struct CubicBSplineInterpolator {
    knots: Vec<f64>,
    /// Control points, `knots.len() + 2` entries for two or more knots
    control: Vec<Vector3<f64>>,
}

impl CubicBSplineInterpolator {
    pub fn new(knots: &[f64], values: &[Vector3<f64>]) -> Self {
        assert_eq!(knots.len(), values.len());
        let n = knots.len();
        if n < 2 {
            return Self {
                knots: knots.to_vec(),
                control: values.to_vec(),
            };
        }

        // Interpolation conditions (c[i] + 4 c[i+1] + c[i+2]) / 6 = v[i]
        // with natural ends pin c[1] and c[n]; the interior is the classic
        // (1, 4, 1) tridiagonal system.
        let mut control = vec![Vector3::zeros(); n + 2];
        control[1] = values[0];
        control[n] = values[n - 1];

        let m = n - 2;
        if m > 0 {
            let mut rhs: Vec<Vector3<f64>> = (0..m).map(|j| 6.0 * values[j + 1]).collect();
            rhs[0] -= values[0];
            rhs[m - 1] -= values[n - 1];

            // Thomas sweep on the (1, 4, 1) system
            let mut diag = vec![4.0; m];
            for j in 1..m {
                let w = 1.0 / diag[j - 1];
                diag[j] -= w;
                let carry = rhs[j - 1] * w;
                rhs[j] -= carry;
            }
            let mut x = vec![Vector3::zeros(); m];
            x[m - 1] = rhs[m - 1] / diag[m - 1];
            for j in (0..m - 1).rev() {
                x[j] = (rhs[j] - x[j + 1]) / diag[j];
            }
            control[2..2 + m].copy_from_slice(&x);
        }

        control[0] = 2.0 * control[1] - control[2];
        control[n + 1] = 2.0 * control[n] - control[n - 1];

        Self {
            knots: knots.to_vec(),
            control,
        }
    }

    /// Evaluate inside the support `[knots.first(), knots.last()]`.
    pub fn interp(&self, t: f64) -> Option<Vector3<f64>> {
        let n = self.knots.len();
        match n {
            0 => return None,
            1 => {
                return ((t - self.knots[0]).abs() <= SUPPORT_EPS).then(|| self.control[0]);
            }
            _ => {}
        }
        if t < self.knots[0] - SUPPORT_EPS || t > self.knots[n - 1] + SUPPORT_EPS {
            return None;
        }

        let seg = self
            .knots
            .partition_point(|&x| x <= t)
            .saturating_sub(1)
            .min(n - 2);
        let u = ((t - self.knots[seg]) / (self.knots[seg + 1] - self.knots[seg])).clamp(0.0, 1.0);

        let u2 = u * u;
        let u3 = u2 * u;
        let b0 = (1.0 - u).powi(3) / 6.0;
        let b1 = (3.0 * u3 - 6.0 * u2 + 4.0) / 6.0;
        let b2 = (-3.0 * u3 + 3.0 * u2 + 3.0 * u + 1.0) / 6.0;
        let b3 = u3 / 6.0;

        Some(
            self.control[seg] * b0
                + self.control[seg + 1] * b1
                + self.control[seg + 2] * b2
                + self.control[seg + 3] * b3,
        )
    }
}

/// Paired rotation/translation correction splines over the sample knots
pub(crate) struct SampleCorrector {
    rot: CubicBSplineInterpolator,
    pos: CubicBSplineInterpolator,
}

impl SampleCorrector {
    pub fn new(sample_states: &VecDeque<SampleState>) -> Self {
        let knots: Vec<f64> = sample_states.iter().map(|s| s.timestamp).collect();
        let rot_values: Vec<Vector3<f64>> = sample_states.iter().map(|s| s.rot_cor()).collect();
        let pos_values: Vec<Vector3<f64>> = sample_states.iter().map(|s| s.pos_cor()).collect();
        Self {
            rot: CubicBSplineInterpolator::new(&knots, &rot_values),
            pos: CubicBSplineInterpolator::new(&knots, &pos_values),
        }
    }

    pub fn get(&self, t: f64) -> Option<(Vector3<f64>, Vector3<f64>)> {
        match (self.rot.interp(t), self.pos.interp(t)) {
            (Some(r), Some(p)) => Some((r, p)),
            (None, None) => None,
            _ => panic!("rotation and translation splines disagree on support at t={}", t),
        }
    }
}

fn iso(pos: &Vector3<f64>, rot: &UnitQuaternion<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(Translation3::from(*pos), *rot)
}

/// Push sample corrections into the dense IMU trajectory.
///
/// Inside the spline support: `rot <- Exp(rot_cor(t)) * rot`,
/// `pos <- pos + pos_cor(t)`. Heads and tails outside the support keep
/// their original transform relative to the nearest corrected state.
pub(crate) fn update_imu_poses(
    sample_states: &VecDeque<SampleState>,
    imu_states: &mut VecDeque<ImuState>,
) {
    if sample_states.is_empty() || imu_states.is_empty() {
        return;
    }
    let corrector = SampleCorrector::new(sample_states);

    let old: Vec<(Vector3<f64>, UnitQuaternion<f64>)> =
        imu_states.iter().map(|s| (s.pos, s.rot)).collect();

    let mut corrected_first = None;
    let mut corrected_last = None;
    for (i, state) in imu_states.iter_mut().enumerate() {
        if let Some((rot_cor, pos_cor)) = corrector.get(state.timestamp) {
            state.rot = UnitQuaternion::from_scaled_axis(rot_cor) * state.rot;
            state.pos += pos_cor;
            if corrected_first.is_none() {
                corrected_first = Some(i);
            }
            corrected_last = Some(i);
        }
    }

    let (Some(first), Some(last)) = (corrected_first, corrected_last) else {
        return;
    };
    if first > 0 || last + 1 < imu_states.len() {
        tracing::debug!(
            head = first,
            tail = imu_states.len() - 1 - last,
            "extending corrections past spline support"
        );
    }

    for i in (0..first).rev() {
        let next = &imu_states[i + 1];
        let pose = iso(&old[i].0, &old[i].1)
            * iso(&old[i + 1].0, &old[i + 1].1).inverse()
            * iso(&next.pos, &next.rot);
        imu_states[i].pos = pose.translation.vector;
        imu_states[i].rot = pose.rotation;
    }
    for i in last + 1..imu_states.len() {
        let prev = &imu_states[i - 1];
        let pose = iso(&old[i].0, &old[i].1)
            * iso(&old[i - 1].0, &old[i - 1].1).inverse()
            * iso(&prev.pos, &prev.rot);
        imu_states[i].pos = pose.translation.vector;
        imu_states[i].rot = pose.rotation;
    }
}

/// Absorb each sample's correction block into its nominal state and zero
/// the block.
pub(crate) fn update_sample_states(sample_states: &mut VecDeque<SampleState>) {
    for s in sample_states.iter_mut() {
        let mut rot = UnitQuaternion::from_scaled_axis(s.rot_cor()) * s.rot;
        rot.renormalize();
        s.rot = rot;
        s.pos += s.pos_cor();
        s.ba += s.ba_cor();
        s.bg += s.bg_cor();
        s.clear_corrections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{COR_DIM, COR_POS, COR_ROT};
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_spline_interpolates_knot_values() {
        let knots = [0.0, 0.1, 0.2, 0.3, 0.4];
        let values = [
            Vector3::new(0.0, 1.0, -2.0),
            Vector3::new(0.5, -1.0, 0.0),
            Vector3::new(-0.25, 0.75, 1.0),
            Vector3::new(1.0, 0.0, 0.5),
            Vector3::new(0.0, 0.0, 0.0),
        ];
        let spline = CubicBSplineInterpolator::new(&knots, &values);

        for (t, v) in knots.iter().zip(&values) {
            let s = spline.interp(*t).unwrap();
            assert_abs_diff_eq!((s - v).norm(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_spline_support_bounds() {
        let knots = [0.0, 0.1, 0.2];
        let values = [Vector3::zeros(), Vector3::x(), Vector3::zeros()];
        let spline = CubicBSplineInterpolator::new(&knots, &values);

        assert!(spline.interp(-0.01).is_none());
        assert!(spline.interp(0.21).is_none());
        assert!(spline.interp(0.0).is_some());
        assert!(spline.interp(0.2).is_some());
        assert!(spline.interp(0.15).is_some());
    }

    #[test]
    fn test_spline_two_knots_is_linear() {
        let knots = [0.0, 1.0];
        let values = [Vector3::zeros(), Vector3::new(2.0, 0.0, 0.0)];
        let spline = CubicBSplineInterpolator::new(&knots, &values);

        for u in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let v = spline.interp(u).unwrap();
            assert_abs_diff_eq!(v.x, 2.0 * u, epsilon = 1e-9);
        }
    }

    fn sample_with_cor(t: f64, rot_cor: Vector3<f64>, pos_cor: Vector3<f64>) -> SampleState {
        let mut cor = [0.0; COR_DIM];
        cor[COR_ROT..COR_ROT + 3].copy_from_slice(rot_cor.as_slice());
        cor[COR_POS..COR_POS + 3].copy_from_slice(pos_cor.as_slice());
        SampleState {
            timestamp: t,
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            grav: Vector3::new(0.0, 0.0, -9.81),
            cor,
        }
    }

    fn moving_imu_states(n: usize, dt: f64) -> VecDeque<ImuState> {
        (0..n)
            .map(|i| ImuState {
                timestamp: i as f64 * dt,
                pos: Vector3::new(i as f64 * 0.01, 0.0, 0.0),
                rot: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), i as f64 * 0.002),
                acc: Vector3::new(0.0, 0.0, 9.81),
                gyr: Vector3::zeros(),
            })
            .collect()
    }

    #[test]
    fn test_zero_corrections_are_a_noop() {
        let samples: VecDeque<SampleState> = (0..4)
            .map(|i| sample_with_cor(i as f64 * 0.05, Vector3::zeros(), Vector3::zeros()))
            .collect();
        let mut imu_states = moving_imu_states(20, 0.01);
        let before: Vec<_> = imu_states.iter().map(|s| (s.pos, s.rot)).collect();

        update_imu_poses(&samples, &mut imu_states);

        for (state, (pos, rot)) in imu_states.iter().zip(&before) {
            assert!((state.pos - pos).norm() < 1e-12);
            assert!(state.rot.angle_to(rot) < 1e-12);
        }
    }

    #[test]
    fn test_constant_correction_shifts_all_covered_states() {
        let shift = Vector3::new(0.0, 0.5, 0.0);
        let samples: VecDeque<SampleState> = (0..4)
            .map(|i| sample_with_cor(i as f64 * 0.05, Vector3::zeros(), shift))
            .collect();
        // IMU states cover exactly the sample span
        let mut imu_states = moving_imu_states(16, 0.01);
        let before: Vec<_> = imu_states.iter().map(|s| s.pos).collect();

        update_imu_poses(&samples, &mut imu_states);

        // A constant spline through constant values
        for (state, pos) in imu_states.iter().zip(&before) {
            assert_abs_diff_eq!((state.pos - pos - shift).norm(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_tail_preserves_relative_transform() {
        let shift = Vector3::new(0.1, 0.0, 0.0);
        let samples: VecDeque<SampleState> = (0..3)
            .map(|i| sample_with_cor(i as f64 * 0.05, Vector3::zeros(), shift))
            .collect();
        // IMU states run past the sample span: tail states beyond t=0.10
        let mut imu_states = moving_imu_states(16, 0.01);
        let before: Vec<_> = imu_states.iter().map(|s| (s.pos, s.rot)).collect();

        update_imu_poses(&samples, &mut imu_states);

        // The extension preserves old(i) * old(i-1)^-1 exactly
        let n = imu_states.len();
        let old_rel =
            iso(&before[n - 1].0, &before[n - 1].1) * iso(&before[n - 2].0, &before[n - 2].1).inverse();
        let new_rel = iso(&imu_states[n - 1].pos, &imu_states[n - 1].rot)
            * iso(&imu_states[n - 2].pos, &imu_states[n - 2].rot).inverse();
        assert_abs_diff_eq!(
            (old_rel.translation.vector - new_rel.translation.vector).norm(),
            0.0,
            epsilon = 1e-9
        );
        assert!(old_rel.rotation.angle_to(&new_rel.rotation) < 1e-9);

        // And the tail rode along with the corrected span (approximately:
        // the per-state rotations bend the carried translation slightly)
        assert!((imu_states[n - 1].pos - before[n - 1].0 - shift).norm() < 1e-2);
    }

    #[test]
    fn test_sample_states_absorb_and_zero() {
        let mut samples: VecDeque<SampleState> = (0..3)
            .map(|i| {
                sample_with_cor(
                    i as f64 * 0.05,
                    Vector3::new(0.0, 0.0, 0.1),
                    Vector3::new(0.2, 0.0, 0.0),
                )
            })
            .collect();
        samples[1].cor[crate::state::COR_BA] = 0.01;
        samples[1].cor[crate::state::COR_BG + 2] = -0.02;

        update_sample_states(&mut samples);

        for s in &samples {
            assert!(s.cor.iter().all(|&v| v == 0.0));
            assert_abs_diff_eq!(s.pos.x, 0.2, epsilon = 1e-12);
            assert_abs_diff_eq!(s.rot.angle(), 0.1, epsilon = 1e-9);
            assert_abs_diff_eq!(s.rot.norm(), 1.0, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(samples[1].ba.x, 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[1].bg.z, -0.02, epsilon = 1e-12);
    }
}
