//! Sim3: similarity transform `p' = s R p + t`.
//!
//! Used for loop and merge corrections in monocular maps, where scale drifts.
//! With stereo, RGB-D or an initialized IMU the scale stays fixed at 1.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::SE3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    pub fn from_se3(pose: &SE3) -> Self {
        Self::new(pose.rotation, pose.translation, 1.0)
    }

    /// Drop the scale from a similarity applied to a camera pose.
    ///
    /// For `S_cw = [sR | t]` the equivalent rigid pose is `[R | t / s]`.
    pub fn to_se3_unscaled(&self) -> SE3 {
        SE3::new(self.rotation, self.translation / self.scale)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let r_inv = self.rotation.inverse();
        let s_inv = 1.0 / self.scale;
        Self::new(r_inv, -(r_inv * self.translation) * s_inv, s_inv)
    }

    /// `self ∘ other`.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.scale * (self.rotation * other.translation) + self.translation,
            self.scale * other.scale,
        )
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Tangent coordinates `[rotvec, t, ln s]`.
    pub fn log(&self) -> [f64; 7] {
        let w = super::so3::log(self.rotation.to_rotation_matrix().matrix());
        [
            w.x,
            w.y,
            w.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    pub fn exp(v: &[f64; 7]) -> Self {
        Self::new(
            UnitQuaternion::from_scaled_axis(Vector3::new(v[0], v[1], v[2])),
            Vector3::new(v[3], v[4], v[5]),
            v[6].exp(),
        )
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Sim3 {
        Sim3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.1, -0.5),
            Vector3::new(1.0, -2.0, 0.5),
            1.7,
        )
    }

    #[test]
    fn test_inverse_undoes_transform() {
        let s = sample();
        let p = Vector3::new(0.3, 0.2, 4.0);
        assert_relative_eq!(s.inverse().transform_point(&s.transform_point(&p)), p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_multiplies_scale() {
        let s = sample();
        let c = s.compose(&s);
        assert_relative_eq!(c.scale, 1.7 * 1.7, epsilon = 1e-12);
        let p = Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(c.transform_point(&p), s.transform_point(&s.transform_point(&p)), epsilon = 1e-12);
    }

    #[test]
    fn test_log_exp() {
        let s = sample();
        let back = Sim3::exp(&s.log());
        assert_relative_eq!(back.scale, s.scale, epsilon = 1e-12);
        assert_relative_eq!(back.translation, s.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_log_of_near_identity_is_finite() {
        let w = Vector3::new(-2e-9, 4e-9, 1e-9);
        let s = Sim3::new(UnitQuaternion::from_scaled_axis(w), Vector3::new(0.1, 0.0, 0.0), 1.0);
        let v = s.log();
        assert!(v.iter().all(|x| x.is_finite()));
        assert_relative_eq!(Vector3::new(v[0], v[1], v[2]), w, epsilon = 1e-14, max_relative = 1e-6);
        assert_relative_eq!(v[6], 0.0);
        let id = Sim3::identity().log();
        assert_relative_eq!(Vector3::new(id[0], id[1], id[2]), Vector3::zeros());
    }

    #[test]
    fn test_unscaled_pose_keeps_camera_center() {
        // The camera center of S_cw must match that of the rigid equivalent.
        let s = sample();
        let center_sim = s.inverse().transform_point(&Vector3::zeros());
        let center_se3 = s.to_se3_unscaled().inverse().translation;
        assert_relative_eq!(center_sim, center_se3, epsilon = 1e-12);
    }
}
