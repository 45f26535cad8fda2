//! IMU ternary factor
//!
//! Couples three consecutive IMU states to the corrections of the sample
//! states bracketing them. The 12 residual rows come in four 3-vector
//! parts: the angular-velocity-derived rotation over `i1 -> i3`, the
//! specific-force-derived velocity over the same span (gravity removed),
//! and the random-walk increments of both biases across the bracket.
//!
//! Corrections at the three IMU timestamps are linearly interpolated
//! between the bracketing sample corrections; when the bracket's right
//! sample is the newest one in the window there is no third block and the
//! factor degrades to two blocks.

use nalgebra::Vector3;

use meridian_solver::math3d::{Quat, Vec3};
use meridian_solver::Real;

use crate::state::{ImuState, SampleState, COR_BA, COR_BG, COR_POS, COR_ROT};

/// Number of sample blocks the factor touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImuTopology {
    /// Bracket right sample is the window's newest: blocks (sp1, sp2)
    TwoSample,
    /// Blocks (sp1, sp2, sp3)
    ThreeSample,
}

/// Assembled IMU factor with all host-side constants baked in
pub struct ImuFactor {
    pub topology: ImuTopology,
    /// Distinct sample indices, ascending; 2 or 3 entries
    pub blocks: [usize; 3],
    pub n_blocks: usize,

    // The three IMU states: timestamps, nominal poses, measurements
    t: [f64; 3],
    q_nom: [[f64; 4]; 3],
    p_nom: [[f64; 3]; 3],
    gyr: [[f64; 3]; 3],
    acc1: [f64; 3],

    // Sample bracket timestamps; t_sp[2] is +inf for the 2-block case
    t_sp: [f64; 3],
    // Nominal biases of the two bracket samples
    bg_nom: [[f64; 3]; 2],
    ba_nom: [[f64; 3]; 2],

    grav: [f64; 3],
    dt: f64,
    weights: [f64; 4],
}

impl ImuFactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        i1: &ImuState,
        i2: &ImuState,
        i3: &ImuState,
        samples: &std::collections::VecDeque<SampleState>,
        sp1: usize,
        sp2: usize,
        sp3: Option<usize>,
        grav: Vector3<f64>,
        dt: f64,
        weights: [f64; 4],
    ) -> Self {
        let quat = |s: &ImuState| {
            let q = s.rot.quaternion();
            [q.w, q.i, q.j, q.k]
        };
        let arr = |v: &Vector3<f64>| [v.x, v.y, v.z];

        let (topology, blocks, n_blocks, t_sp3) = match sp3 {
            Some(sp3) => (
                ImuTopology::ThreeSample,
                [sp1, sp2, sp3],
                3,
                samples[sp3].timestamp,
            ),
            None => (ImuTopology::TwoSample, [sp1, sp2, 0], 2, f64::INFINITY),
        };

        Self {
            topology,
            blocks,
            n_blocks,
            t: [i1.timestamp, i2.timestamp, i3.timestamp],
            q_nom: [quat(i1), quat(i2), quat(i3)],
            p_nom: [arr(&i1.pos), arr(&i2.pos), arr(&i3.pos)],
            gyr: [arr(&i1.gyr), arr(&i2.gyr), arr(&i3.gyr)],
            acc1: arr(&i1.acc),
            t_sp: [samples[sp1].timestamp, samples[sp2].timestamp, t_sp3],
            bg_nom: [arr(&samples[sp1].bg), arr(&samples[sp2].bg)],
            ba_nom: [arr(&samples[sp1].ba), arr(&samples[sp2].ba)],
            grav: arr(&grav),
            dt,
            weights,
        }
    }

    /// Linearly interpolate a 3-span of the correction blocks at time `t`.
    ///
    /// Times at or below the middle sample interpolate in (sp1, sp2);
    /// later times fall into (sp2, sp3). The fraction may run slightly past
    /// 1 when IMU spacing exceeds the sample interval; linear extrapolation
    /// is intended there.
    fn interp_span<T: Real>(&self, t: f64, span: usize, cors: &[&[T]]) -> Vec3<T> {
        let pick = |block: usize| {
            Vec3::new(
                cors[block][span],
                cors[block][span + 1],
                cors[block][span + 2],
            )
        };
        if t <= self.t_sp[1] || self.n_blocks == 2 {
            let alpha = (t - self.t_sp[0]) / (self.t_sp[1] - self.t_sp[0]);
            let a = T::from_literal(alpha);
            pick(0).scale(T::one() - a) + pick(1).scale(a)
        } else {
            let alpha = (t - self.t_sp[1]) / (self.t_sp[2] - self.t_sp[1]);
            let a = T::from_literal(alpha);
            pick(1).scale(T::one() - a) + pick(2).scale(a)
        }
    }

    /// Evaluate the 12 residual rows given one 12-dim correction slice per
    /// distinct block (same order as `blocks`).
    pub(crate) fn evaluate<T: Real>(&self, cors: &[&[T]]) -> [T; 12] {
        debug_assert_eq!(cors.len(), self.n_blocks);

        // Corrected poses at the three IMU timestamps
        let mut q = [Quat::<T>::identity(); 3];
        let mut p = [Vec3::<T>::zero(); 3];
        for k in 0..3 {
            let rot_cor = self.interp_span(self.t[k], COR_ROT, cors);
            let pos_cor = self.interp_span(self.t[k], COR_POS, cors);
            q[k] = Quat::from_axis_angle(rot_cor) * Quat::from_array(self.q_nom[k]);
            p[k] = Vec3::from_array(self.p_nom[k]) + pos_cor;
        }

        // Operating-point biases at i1
        let bg = Vec3::from_array(self.bg_nom[0]) + self.interp_span(self.t[0], COR_BG, cors);
        let ba = Vec3::from_array(self.ba_nom[0]) + self.interp_span(self.t[0], COR_BA, cors);

        let dt = T::from_literal(self.dt);
        let half = T::from_literal(0.5);

        // Rotation over i1 -> i3 from the averaged gyro rates
        let w12 = (Vec3::from_array(self.gyr[0]) + Vec3::from_array(self.gyr[1])).scale(half) - bg;
        let w23 = (Vec3::from_array(self.gyr[1]) + Vec3::from_array(self.gyr[2])).scale(half) - bg;
        let delta_meas =
            Quat::from_axis_angle(w12.scale(dt)) * Quat::from_axis_angle(w23.scale(dt));
        let delta_pred = q[0].conjugate() * q[2];
        let r_gyro = (delta_meas.conjugate() * delta_pred)
            .to_axis_angle()
            .scale(T::from_literal(self.weights[0]));

        // Velocity over i1 -> i3 against the measured specific force
        let inv_dt = T::from_literal(1.0 / self.dt);
        let v12 = (p[1] - p[0]).scale(inv_dt);
        let v23 = (p[2] - p[1]).scale(inv_dt);
        let dv_meas =
            (q[0].rotate_vec(Vec3::from_array(self.acc1) - ba) + Vec3::from_array(self.grav))
                .scale(dt);
        let r_acc = (v23 - v12 - dv_meas).scale(T::from_literal(self.weights[1]));

        // Bias random walks across the bracket
        let bg1 = Vec3::<T>::from_array(self.bg_nom[0])
            + Vec3::new(cors[0][COR_BG], cors[0][COR_BG + 1], cors[0][COR_BG + 2]);
        let bg2 = Vec3::<T>::from_array(self.bg_nom[1])
            + Vec3::new(cors[1][COR_BG], cors[1][COR_BG + 1], cors[1][COR_BG + 2]);
        let ba1 = Vec3::<T>::from_array(self.ba_nom[0])
            + Vec3::new(cors[0][COR_BA], cors[0][COR_BA + 1], cors[0][COR_BA + 2]);
        let ba2 = Vec3::<T>::from_array(self.ba_nom[1])
            + Vec3::new(cors[1][COR_BA], cors[1][COR_BA + 1], cors[1][COR_BA + 2]);
        let r_bg = (bg2 - bg1).scale(T::from_literal(self.weights[2]));
        let r_ba = (ba2 - ba1).scale(T::from_literal(self.weights[3]));

        [
            r_gyro.x, r_gyro.y, r_gyro.z, r_acc.x, r_acc.y, r_acc.z, r_bg.x, r_bg.y, r_bg.z,
            r_ba.x, r_ba.y, r_ba.z,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::COR_DIM;
    use approx::assert_abs_diff_eq;
    use nalgebra::UnitQuaternion;
    use std::collections::VecDeque;

    const DT: f64 = 0.01;

    fn imu_state(t: f64, pos: Vector3<f64>, gyr: Vector3<f64>, acc: Vector3<f64>) -> ImuState {
        ImuState {
            timestamp: t,
            pos,
            rot: UnitQuaternion::identity(),
            acc,
            gyr,
        }
    }

    fn sample(t: f64) -> SampleState {
        SampleState {
            timestamp: t,
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            ba: Vector3::zeros(),
            bg: Vector3::zeros(),
            grav: Vector3::new(0.0, 0.0, -9.81),
            cor: [0.0; COR_DIM],
        }
    }

    fn static_factor(sp3: Option<usize>) -> ImuFactor {
        let samples: VecDeque<SampleState> =
            (0..3).map(|i| sample(i as f64 * 0.05)).collect();
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let i1 = imu_state(0.00, Vector3::zeros(), Vector3::zeros(), acc);
        let i2 = imu_state(0.01, Vector3::zeros(), Vector3::zeros(), acc);
        let i3 = imu_state(0.02, Vector3::zeros(), Vector3::zeros(), acc);
        ImuFactor::new(
            &i1,
            &i2,
            &i3,
            &samples,
            0,
            1,
            sp3,
            Vector3::new(0.0, 0.0, -9.81),
            DT,
            [1.0, 1.0, 1.0, 1.0],
        )
    }

    #[test]
    fn test_static_rig_zero_residual() {
        for sp3 in [None, Some(2)] {
            let factor = static_factor(sp3);
            let zeros = [0.0; COR_DIM];
            let cors: Vec<&[f64]> = (0..factor.n_blocks).map(|_| &zeros[..]).collect();
            let r = factor.evaluate(&cors);
            for v in r.iter() {
                assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_bias_walk_rows() {
        let factor = static_factor(Some(2));
        let zeros = [0.0; COR_DIM];
        let mut cor2 = [0.0; COR_DIM];
        cor2[COR_BG] = 0.01; // gyro-bias correction on the later sample
        cor2[COR_BA + 1] = 0.02;
        let cors: Vec<&[f64]> = vec![&zeros, &cor2, &zeros];

        let r = factor.evaluate(&cors);
        assert_abs_diff_eq!(r[6], 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(r[10], 0.02, epsilon = 1e-12);
    }

    #[test]
    fn test_in_bracket_position_corrections_are_linear() {
        // All three IMU timestamps inside one bracket: the interpolated
        // position correction is linear in time, so the second difference
        // cannot see it. Only boundary-straddling triples anchor pos_cor.
        let factor = static_factor(None);
        let zeros = [0.0; COR_DIM];
        let mut cor2 = [0.0; COR_DIM];
        cor2[COR_POS + 2] = 0.05;
        let cors: Vec<&[f64]> = vec![&zeros, &cor2];

        let r = factor.evaluate(&cors);
        for v in &r {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_straddling_triple_senses_position_correction() {
        // Sample grid at 0.02 spacing; the triple (0.01, 0.02, 0.03)
        // crosses the middle sample, so a correction kink there shows up in
        // the second difference.
        let samples: VecDeque<SampleState> =
            (0..3).map(|i| sample(i as f64 * 0.02)).collect();
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let i1 = imu_state(0.01, Vector3::zeros(), Vector3::zeros(), acc);
        let i2 = imu_state(0.02, Vector3::zeros(), Vector3::zeros(), acc);
        let i3 = imu_state(0.03, Vector3::zeros(), Vector3::zeros(), acc);
        let factor = ImuFactor::new(
            &i1,
            &i2,
            &i3,
            &samples,
            0,
            1,
            Some(2),
            Vector3::new(0.0, 0.0, -9.81),
            DT,
            [1.0, 1.0, 1.0, 1.0],
        );

        let zeros = [0.0; COR_DIM];
        let mut cor2 = [0.0; COR_DIM];
        cor2[COR_POS + 2] = 0.05; // kink at the middle sample
        let cors: Vec<&[f64]> = vec![&zeros, &cor2, &zeros];

        let r = factor.evaluate(&cors);
        // p_cor(z) = 0.025, 0.05, 0.025 -> (v23 - v12) = -5.0 m/s
        assert_abs_diff_eq!(r[5], -5.0, epsilon = 1e-9);
        // Gyro rows stay untouched by translation
        assert_abs_diff_eq!(r[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_gyro_rows_track_rotation_mismatch() {
        // Measured rates say "rotating", predicted poses say "static"
        let samples: VecDeque<SampleState> =
            (0..2).map(|i| sample(i as f64 * 0.05)).collect();
        let omega = Vector3::new(0.0, 0.0, 0.5);
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let i1 = imu_state(0.00, Vector3::zeros(), omega, acc);
        let i2 = imu_state(0.01, Vector3::zeros(), omega, acc);
        let i3 = imu_state(0.02, Vector3::zeros(), omega, acc);
        let factor = ImuFactor::new(
            &i1,
            &i2,
            &i3,
            &samples,
            0,
            1,
            None,
            Vector3::new(0.0, 0.0, -9.81),
            DT,
            [1.0, 1.0, 1.0, 1.0],
        );

        let zeros = [0.0; COR_DIM];
        let cors: Vec<&[f64]> = vec![&zeros, &zeros];
        let r = factor.evaluate(&cors);

        // Expected mismatch: -omega_z * 2 dt
        assert_abs_diff_eq!(r[2], -0.5 * 2.0 * DT, epsilon = 1e-9);
    }

    #[test]
    fn test_jacobian_via_jets_matches_finite_difference() {
        use meridian_solver::Jet;

        let factor = static_factor(None);

        // Jet evaluation: 2 blocks x 12 dims
        let jets: Vec<[Jet<24>; COR_DIM]> = (0..2)
            .map(|b| std::array::from_fn(|d| Jet::variable(0.0, b * COR_DIM + d)))
            .collect();
        let cor_slices: Vec<&[Jet<24>]> = jets.iter().map(|a| &a[..]).collect();
        let r_jet = factor.evaluate(&cor_slices);

        // Finite differences against a rotation correction on the later
        // sample, which reaches the gyro rows through the interpolated pose
        let h = 1e-7;
        let zeros = [0.0; COR_DIM];
        let mut bumped = [0.0; COR_DIM];
        bumped[COR_ROT] = h;
        let r0 = factor.evaluate(&[&zeros[..], &zeros[..]]);
        let r1 = factor.evaluate(&[&zeros[..], &bumped[..]]);

        let param_idx = COR_DIM + COR_ROT;
        let mut saw_nonzero = false;
        for row in 0..12 {
            let fd = (r1[row] - r0[row]) / h;
            assert_abs_diff_eq!(r_jet[row].derivs[param_idx], fd, epsilon = 1e-5);
            if fd.abs() > 1e-3 {
                saw_nonzero = true;
            }
        }
        assert!(saw_nonzero, "rotation correction must reach the residual");
    }
}
