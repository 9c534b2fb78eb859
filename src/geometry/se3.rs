//! SE3: rigid body transform (rotation + translation).
//!
//! Poses in this crate are stored as `T_wc` (camera to world). The optimizers
//! work on `T_cw` and convert with [`SE3::inverse`].

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

use super::so3;

/// Rigid transform `p' = R * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix that may carry numerical drift.
    ///
    /// The matrix is re-orthonormalized before conversion.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let r = so3::normalize_rotation(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r)),
            translation,
        }
    }

    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let q = nalgebra::Quaternion::new(qw, qx, qy, qz);
        Self {
            rotation: UnitQuaternion::from_quaternion(q),
            translation,
        }
    }

    /// Build from a homogeneous matrix `[R | t; 0 0 0 1]`.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::from_rt(&r, t)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.inverse();
        Self {
            rotation: r_inv,
            translation: -(r_inv * self.translation),
        }
    }

    /// `self ∘ other`, i.e. apply `other` first.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Exponential map with twist ordering `[ω, υ]`.
    ///
    /// Uses a decoupled retraction (rotation and translation updated
    /// independently), which matches how the optimizers parameterize poses.
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let omega = Vector3::new(xi[0], xi[1], xi[2]);
        let upsilon = Vector3::new(xi[3], xi[4], xi[5]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: upsilon,
        }
    }

    /// Left-multiplicative update `exp(δ) ∘ self`, as g2o's `VertexSE3Expmap`.
    pub fn retract_left(&self, delta: &Vector6<f64>) -> Self {
        let omega = Vector3::new(delta[0], delta[1], delta[2]);
        let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
        let dr = UnitQuaternion::from_scaled_axis(omega);
        Self {
            rotation: dr * self.rotation,
            translation: dr * self.translation + upsilon,
        }
    }

    /// True when the rotation block is orthonormal with determinant 1 and
    /// every entry is finite.
    pub fn is_valid_rigid(&self, tolerance: f64) -> bool {
        let r = self.rotation_matrix();
        if !r.iter().chain(self.translation.iter()).all(|v| v.is_finite()) {
            return false;
        }
        let rtr = r.transpose() * r;
        (rtr - Matrix3::identity()).abs().max() < tolerance && (r.determinant() - 1.0).abs() < tolerance
    }

    /// Rotation angle (radians) and translation norm of the relative motion.
    pub fn magnitude(&self) -> (f64, f64) {
        (self.rotation.angle(), self.translation.norm())
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7),
            Vector3::new(0.5, -1.0, 2.0),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_round_trip_preserves_points() {
        let t = sample_pose();
        let back = SE3::from_matrix(&t.to_matrix());
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(t.transform_point(&p), back.transform_point(&p), epsilon = 1e-12);
    }

    #[test]
    fn test_identity_matrix_is_eye() {
        assert_eq!(SE3::identity().to_matrix(), Matrix4::identity());
    }

    #[test]
    fn test_valid_rigid_detects_nan() {
        assert!(sample_pose().is_valid_rigid(1e-9));
        let mut bad = sample_pose();
        bad.translation.x = f64::NAN;
        assert!(!bad.is_valid_rigid(1e-9));
    }

    #[test]
    fn test_retract_left_small_step() {
        let t = sample_pose();
        let delta = Vector6::new(0.0, 0.0, 0.0, 0.1, 0.0, 0.0);
        let moved = t.retract_left(&delta);
        assert_relative_eq!(moved.translation - t.translation, Vector3::new(0.1, 0.0, 0.0), epsilon = 1e-12);
    }
}
