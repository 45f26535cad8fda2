//! Surfel-to-surfel binary factor
//!
//! A correspondence constrains the poses at two surfel timestamps. Each
//! pose is interpolated inside its bracketing sample pair, with the
//! correction blocks layered onto the nominal sample poses. Three residual
//! rows: one point-to-plane distance along the earlier surfel's normal and
//! a two-axis normal-alignment term, expressed on a tangent basis of the
//! earlier surfel's local normal.

use nalgebra::Vector3;

use meridian_solver::math3d::Vec3;
use meridian_solver::Real;

use crate::state::{SampleState, Surfel};

use super::{corrected_pose, interp_pose, PoseCor};

/// Which sample blocks the two brackets share.
///
/// Picking the minimal block set keeps the Jacobian narrow: brackets far
/// apart need four blocks, brackets sharing a sample need three, brackets
/// inside one interval need two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfelTopology {
    /// `R1 < L2`: blocks (L1, R1, L2, R2)
    Disjoint,
    /// `R1 == L2`: blocks (L1, R1, R2)
    Adjacent,
    /// `R1 > L2` (same interval): blocks (L1, R1)
    Overlapping,
}

/// Assembled surfel factor: all host-side constants plus the indices of its
/// distinct sample blocks (ascending).
pub struct SurfelFactor {
    pub topology: SurfelTopology,
    /// Distinct sample indices, ascending; 4, 3 or 2 entries per topology
    pub blocks: [usize; 4],
    pub n_blocks: usize,

    // Interpolation fractions inside each bracket
    alpha1: f64,
    alpha2: f64,

    // Nominal bracket poses, scalar-first quaternions
    q1: [[f64; 4]; 2],
    p1: [[f64; 3]; 2],
    q2: [[f64; 4]; 2],
    p2: [[f64; 3]; 2],

    // Surfel geometry in the body frames at their timestamps
    local_c1: [f64; 3],
    local_c2: [f64; 3],
    local_n2: [f64; 3],
    /// Earlier surfel's local normal and a tangent basis perpendicular to it
    local_n1: [f64; 3],
    tangent1: [[f64; 3]; 2],
}

/// Role map from (L1, R1, L2, R2) onto the distinct block slots
const ROLES_DISJOINT: [usize; 4] = [0, 1, 2, 3];
const ROLES_ADJACENT: [usize; 4] = [0, 1, 1, 2];
const ROLES_OVERLAPPING: [usize; 4] = [0, 1, 0, 1];

impl SurfelFactor {
    /// Build a factor from a correspondence and its bracketing samples.
    ///
    /// `(l1, r1)` bracket the earlier surfel's timestamp, `(l2, r2)` the
    /// later one's; all four index into `samples`.
    pub fn new(
        s1: &Surfel,
        s2: &Surfel,
        samples: &std::collections::VecDeque<SampleState>,
        l1: usize,
        r1: usize,
        l2: usize,
        r2: usize,
    ) -> Self {
        debug_assert!(s1.timestamp < s2.timestamp);
        let (topology, blocks, n_blocks) = if r1 < l2 {
            (SurfelTopology::Disjoint, [l1, r1, l2, r2], 4)
        } else if r1 == l2 {
            (SurfelTopology::Adjacent, [l1, r1, r2, 0], 3)
        } else {
            debug_assert_eq!(l1, l2);
            (SurfelTopology::Overlapping, [l1, r1, 0, 0], 2)
        };

        let frac = |t: f64, l: usize, r: usize| {
            (t - samples[l].timestamp) / (samples[r].timestamp - samples[l].timestamp)
        };

        let quat = |s: &SampleState| {
            let q = s.rot.quaternion();
            [q.w, q.i, q.j, q.k]
        };
        let pos = |s: &SampleState| [s.pos.x, s.pos.y, s.pos.z];
        let arr = |v: &Vector3<f64>| [v.x, v.y, v.z];

        let (b1, b2) = tangent_basis(&s1.local_normal);

        Self {
            topology,
            blocks,
            n_blocks,
            alpha1: frac(s1.timestamp, l1, r1),
            alpha2: frac(s2.timestamp, l2, r2),
            q1: [quat(&samples[l1]), quat(&samples[r1])],
            p1: [pos(&samples[l1]), pos(&samples[r1])],
            q2: [quat(&samples[l2]), quat(&samples[r2])],
            p2: [pos(&samples[l2]), pos(&samples[r2])],
            local_c1: arr(&s1.local_centroid),
            local_c2: arr(&s2.local_centroid),
            local_n2: arr(&s2.local_normal),
            local_n1: arr(&s1.local_normal),
            tangent1: [arr(&b1), arr(&b2)],
        }
    }

    fn roles(&self) -> [usize; 4] {
        match self.topology {
            SurfelTopology::Disjoint => ROLES_DISJOINT,
            SurfelTopology::Adjacent => ROLES_ADJACENT,
            SurfelTopology::Overlapping => ROLES_OVERLAPPING,
        }
    }

    /// Evaluate the 3 residual rows given one pose-correction per distinct
    /// block (same order as `blocks`).
    pub(crate) fn evaluate<T: Real>(&self, cors: &[PoseCor<T>]) -> [T; 3] {
        debug_assert_eq!(cors.len(), self.n_blocks);
        let roles = self.roles();

        let (q_l1, p_l1) = corrected_pose(self.q1[0], self.p1[0], &cors[roles[0]]);
        let (q_r1, p_r1) = corrected_pose(self.q1[1], self.p1[1], &cors[roles[1]]);
        let (q_l2, p_l2) = corrected_pose(self.q2[0], self.p2[0], &cors[roles[2]]);
        let (q_r2, p_r2) = corrected_pose(self.q2[1], self.p2[1], &cors[roles[3]]);

        let (q1, p1) = interp_pose(q_l1, p_l1, q_r1, p_r1, self.alpha1);
        let (q2, p2) = interp_pose(q_l2, p_l2, q_r2, p_r2, self.alpha2);

        let c1 = q1.rotate_vec(Vec3::from_array(self.local_c1)) + p1;
        let c2 = q2.rotate_vec(Vec3::from_array(self.local_c2)) + p2;
        let n1 = q1.rotate_vec(Vec3::from_array(self.local_n1));
        let n2 = q2.rotate_vec(Vec3::from_array(self.local_n2));

        // Point-to-plane distance along the earlier normal
        let dist = n1.dot(c2 - c1);

        // Normal alignment: express the later normal in the earlier
        // surfel's frame and project onto the tangent basis. Both
        // components vanish iff the normals are (anti-)parallel.
        let n2_in_1 = q1.conjugate().rotate_vec(n2);
        let a1 = Vec3::from_array(self.tangent1[0]).dot(n2_in_1);
        let a2 = Vec3::from_array(self.tangent1[1]).dot(n2_in_1);

        [dist, a1, a2]
    }
}

/// Orthonormal basis of the plane perpendicular to `n`
fn tangent_basis(n: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let pick = if n.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let b1 = n.cross(&pick).normalize();
    let b2 = n.cross(&b1);
    (b1, b2)
}
