//! Factor residuals
//!
//! The cores are generic over [`Real`] so the same code produces plain
//! residual values (f64) and residuals with Jacobians (jets). All host-side
//! quantities (nominal poses, interpolation fractions, surfel geometry) are
//! baked into the factor structs as `f64` constants at assembly time; only
//! the 12-dimensional correction blocks are variables.

pub mod imu;
pub mod surfel;

use meridian_solver::math3d::{Quat, Vec3};
use meridian_solver::Real;

pub use imu::{ImuFactor, ImuTopology};
pub use surfel::{SurfelFactor, SurfelTopology};

/// Pose slice of one correction block: axis-angle rotation + translation
pub(crate) struct PoseCor<T> {
    pub rot: Vec3<T>,
    pub pos: Vec3<T>,
}

/// Apply a correction block to a nominal pose:
/// `q = Exp(rot_cor) * q_nom`, `p = p_nom + pos_cor`
pub(crate) fn corrected_pose<T: Real>(
    q_nom: [f64; 4],
    p_nom: [f64; 3],
    cor: &PoseCor<T>,
) -> (Quat<T>, Vec3<T>) {
    let q = Quat::from_axis_angle(cor.rot) * Quat::from_array(q_nom);
    let p = Vec3::from_array(p_nom) + cor.pos;
    (q, p)
}

/// Interpolate between two corrected poses at fraction `alpha`: linear in
/// translation, geodesic in rotation.
pub(crate) fn interp_pose<T: Real>(
    q_l: Quat<T>,
    p_l: Vec3<T>,
    q_r: Quat<T>,
    p_r: Vec3<T>,
    alpha: f64,
) -> (Quat<T>, Vec3<T>) {
    let a = T::from_literal(alpha);
    let phi = (q_l.conjugate() * q_r).to_axis_angle();
    let q = q_l * Quat::from_axis_angle(phi.scale(a));
    let p = p_l.scale(T::one() - a) + p_r.scale(a);
    (q, p)
}

/// Cauchy robust reweighting for one residual block.
///
/// The solver consumes plain rows, so the loss is applied as the standard
/// IRLS row scaling `sqrt(rho'(s))` with `rho(s) = c² ln(1 + s/c²)` and
/// `s` the block's squared norm.
pub(crate) fn cauchy_weight(scale: f64, squared_norm: f64) -> f64 {
    let c2 = scale * scale;
    1.0 / (1.0 + squared_norm / c2).sqrt()
}
