//! 3D math primitives with automatic differentiation support
//!
//! `Vec3` and `Quat` are generic over any [`Real`], so the same rotation
//! and transform code runs on plain `f64` and on jets inside residual
//! evaluation. Host-side code (deques, interpolation, publishing) uses
//! nalgebra; these types exist only where derivatives must flow.

use crate::Real;

/// 3D vector generic over any Real type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Copy> Vec3<T> {
    pub const fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }
}

impl<T: Real> Vec3<T> {
    pub fn zero() -> Self {
        Self {
            x: T::zero(),
            y: T::zero(),
            z: T::zero(),
        }
    }

    /// Lift a host-side `[f64; 3]` into constants
    pub fn from_array(v: [f64; 3]) -> Self {
        Self {
            x: T::from_literal(v[0]),
            y: T::from_literal(v[1]),
            z: T::from_literal(v[2]),
        }
    }

    pub fn dot(self, other: Self) -> T {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn norm_squared(self) -> T {
        self.dot(self)
    }

    pub fn norm(self) -> T {
        self.norm_squared().sqrt()
    }

    /// Component-wise scaling by a scalar
    pub fn scale(self, s: T) -> Self {
        Self {
            x: self.x * s,
            y: self.y * s,
            z: self.z * s,
        }
    }
}

impl<T: Real> std::ops::Add for Vec3<T> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            x: self.x + other.x,
            y: self.y + other.y,
            z: self.z + other.z,
        }
    }
}

impl<T: Real> std::ops::Sub for Vec3<T> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }
}

impl<T: Real> std::ops::Neg for Vec3<T> {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

/// Unit quaternion for 3D rotations, generic over any Real type
///
/// Scalar-first convention: q = w + xi + yj + zk. Rotation quaternions are
/// kept normalized by the callers; composition helpers do not renormalize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quat<T> {
    pub w: T,
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Copy> Quat<T> {
    pub const fn new(w: T, x: T, y: T, z: T) -> Self {
        Self { w, x, y, z }
    }
}

impl<T: Real> Quat<T> {
    pub fn identity() -> Self {
        Self {
            w: T::one(),
            x: T::zero(),
            y: T::zero(),
            z: T::zero(),
        }
    }

    /// Lift a host-side scalar-first `[w, x, y, z]` into constants
    pub fn from_array(q: [f64; 4]) -> Self {
        Self {
            w: T::from_literal(q[0]),
            x: T::from_literal(q[1]),
            y: T::from_literal(q[2]),
            z: T::from_literal(q[3]),
        }
    }

    /// Conjugate (inverse for unit quaternions)
    pub fn conjugate(self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn norm_squared(self) -> T {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn normalize(self) -> Self {
        let n = self.norm_squared().sqrt();
        Self {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }

    /// Hamilton product: q1 * q2 applies rotation q2 first, then q1
    pub fn mul(self, other: Self) -> Self {
        Self {
            w: self.w * other.w - self.x * other.x - self.y * other.y - self.z * other.z,
            x: self.w * other.x + self.x * other.w + self.y * other.z - self.z * other.y,
            y: self.w * other.y - self.x * other.z + self.y * other.w + self.z * other.x,
            z: self.w * other.z + self.x * other.y - self.y * other.x + self.z * other.w,
        }
    }

    /// Rotate a 3D vector by this quaternion
    ///
    /// Uses v' = v + 2w(q_xyz × v) + 2(q_xyz × (q_xyz × v)), which avoids
    /// the full sandwich product.
    pub fn rotate_vec(self, v: Vec3<T>) -> Vec3<T> {
        let two = T::from_literal(2.0);
        let tx = two * (self.y * v.z - self.z * v.y);
        let ty = two * (self.z * v.x - self.x * v.z);
        let tz = two * (self.x * v.y - self.y * v.x);

        Vec3 {
            x: v.x + self.w * tx + (self.y * tz - self.z * ty),
            y: v.y + self.w * ty + (self.z * tx - self.x * tz),
            z: v.z + self.w * tz + (self.x * ty - self.y * tx),
        }
    }

    /// Exponential map: rotation vector (axis * angle) to unit quaternion
    ///
    /// Blends a Taylor expansion of sin(θ/2)/θ into the exact formula so
    /// that values and derivatives stay correct through θ = 0.
    pub fn from_axis_angle(rvec: Vec3<T>) -> Self {
        let theta_sq = rvec.norm_squared();
        let theta = theta_sq.sqrt();
        let half_theta = theta * T::from_literal(0.5);

        let sin_half = half_theta.sin();
        let cos_half = half_theta.cos();

        // Taylor: sin(θ/2)/θ ≈ 1/2 - θ²/48
        let taylor_sinc_half = T::from_literal(0.5) - theta_sq * T::from_literal(1.0 / 48.0);

        let theta_safe = (theta_sq + T::from_literal(1e-20)).sqrt();
        let exact_sinc_half = sin_half / theta_safe;

        let blend = theta_sq / (theta_sq + T::from_literal(0.001));
        let sinc_half = taylor_sinc_half * (T::one() - blend) + exact_sinc_half * blend;

        Self {
            w: cos_half,
            x: sinc_half * rvec.x,
            y: sinc_half * rvec.y,
            z: sinc_half * rvec.z,
        }
    }

    /// Logarithm map: unit quaternion to rotation vector ω = θ * axis
    ///
    /// The angle comes from atan2 rather than acos(w): near the identity,
    /// rounding can push w a hair above 1 and acos would go NaN.
    pub fn to_axis_angle(self) -> Vec3<T> {
        let xyz_norm_sq = self.x * self.x + self.y * self.y + self.z * self.z;
        let xyz_norm = xyz_norm_sq.sqrt();

        let theta = xyz_norm.atan2(self.w) * T::from_literal(2.0);
        let theta_sq = theta * theta;

        // Taylor: θ / sin(θ/2) ≈ 2 + θ²/12
        let taylor_k = T::from_literal(2.0) + theta_sq * T::from_literal(1.0 / 12.0);

        let exact_k = theta / (xyz_norm + T::from_literal(1e-10));

        let blend = xyz_norm_sq / (xyz_norm_sq + T::from_literal(0.0001));
        let k = taylor_k * (T::one() - blend) + exact_k * blend;

        Vec3 {
            x: k * self.x,
            y: k * self.y,
            z: k * self.z,
        }
    }
}

impl<T: Real> std::ops::Mul for Quat<T> {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        self.mul(other)
    }
}
