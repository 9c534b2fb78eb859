//! Nonlinear optimization backends.
//!
//! Every solver follows the same collect / solve / apply split:
//! - collect: copy the variables and measurements out of the map under a read lock
//! - solve: iterate with no lock held, polling a `should_stop` closure
//! - apply: write results back under a write lock, skipping entities that
//!   disappeared in the meantime
//!
//! Solvers report [`SlamError::OptimizationDivergence`] when the cost turns
//! non-finite or ends above where it started; callers keep the prior estimate.
//!
//! [`SlamError::OptimizationDivergence`]: crate::error::SlamError::OptimizationDivergence

pub mod bundle_adjustment;
pub mod inertial_init;
pub mod pose_graph;
pub mod pose_only;

use nalgebra::{Matrix3, Matrix3x6, Vector3};

use crate::features::ScalePyramid;
use crate::geometry::so3::skew;
use crate::geometry::CameraModel;
use crate::tracking::frame::FrameFeatures;

/// χ² (95%) for a monocular reprojection (2 DoF).
pub const CHI2_MONO: f64 = 5.991;
/// χ² (95%) for a stereo reprojection (3 DoF).
pub const CHI2_STEREO: f64 = 7.815;

/// LM damping schedule shared by the hand-written solvers.
pub(crate) const LAMBDA_INIT: f64 = 1e-3;
pub(crate) const LAMBDA_UP: f64 = 10.0;
pub(crate) const LAMBDA_DOWN: f64 = 0.1;
pub(crate) const LAMBDA_MAX: f64 = 1e10;
pub(crate) const LAMBDA_MIN: f64 = 1e-10;

/// A keypoint observation used as a reprojection measurement.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub u: f64,
    pub v: f64,
    /// Right-image coordinate for stereo/RGB-D observations.
    pub u_right: Option<f64>,
    /// 1/σ² at the keypoint's pyramid level.
    pub inv_sigma2: f64,
}

impl Measurement {
    /// Undistorted keypoint `idx` of a frame or KeyFrame.
    pub fn from_features(features: &FrameFeatures, idx: usize, pyramid: &ScalePyramid) -> Self {
        let kp = &features.keypoints_un[idx];
        Self {
            u: kp.x,
            v: kp.y,
            u_right: features.u_right.get(idx).copied().flatten(),
            inv_sigma2: pyramid.inv_sigma2(kp.octave),
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.u_right.is_some()
    }

    pub fn chi2_threshold(&self) -> f64 {
        if self.is_stereo() {
            CHI2_STEREO
        } else {
            CHI2_MONO
        }
    }

    /// Projection minus observation. The third entry is zero for monocular.
    pub fn residual(&self, pc: &Vector3<f64>, camera: &CameraModel) -> Vector3<f64> {
        let uv = camera.project(pc);
        let ur = match self.u_right {
            Some(ur) => camera.project_right_u(pc) - ur,
            None => 0.0,
        };
        Vector3::new(uv.x - self.u, uv.y - self.v, ur)
    }

    pub fn chi2(&self, pc: &Vector3<f64>, camera: &CameraModel) -> f64 {
        self.residual(pc, camera).norm_squared() * self.inv_sigma2
    }
}

/// Derivative of `(u, v, u_right)` with respect to the camera-frame point.
///
/// The third row is zero for monocular measurements.
pub(crate) fn projection_jacobian(pc: &Vector3<f64>, camera: &CameraModel, stereo: bool) -> Matrix3<f64> {
    let inv_z = 1.0 / pc.z;
    let inv_z2 = inv_z * inv_z;
    let du = [camera.fx * inv_z, 0.0, -camera.fx * pc.x * inv_z2];
    let dv = [0.0, camera.fy * inv_z, -camera.fy * pc.y * inv_z2];
    let dr = if stereo {
        [du[0], 0.0, du[2] + camera.bf * inv_z2]
    } else {
        [0.0; 3]
    };
    Matrix3::new(du[0], du[1], du[2], dv[0], dv[1], dv[2], dr[0], dr[1], dr[2])
}

/// Derivative of `T_cw · p` under a left perturbation `[ω, υ]` of `T_cw`.
pub(crate) fn pose_point_jacobian(pc: &Vector3<f64>) -> Matrix3x6<f64> {
    let mut j = Matrix3x6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(pc)));
    j.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
    j
}

/// Huber weight on a χ² value.
pub(crate) fn huber_weight(chi2: f64, threshold: f64) -> f64 {
    if chi2 <= threshold {
        1.0
    } else {
        (threshold / chi2).sqrt()
    }
}

/// Huber cost on a χ² value.
pub(crate) fn huber_cost(chi2: f64, threshold: f64) -> f64 {
    if chi2 <= threshold {
        chi2
    } else {
        2.0 * (threshold * chi2).sqrt() - threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector6};

    fn camera() -> CameraModel {
        let mut c = CameraModel::pinhole(450.0, 440.0, 320.0, 240.0, 640, 480);
        c.bf = 45.0;
        c
    }

    #[test]
    fn test_projection_jacobian_numerical() {
        let cam = camera();
        let pc = Vector3::new(0.3, -0.2, 2.5);
        let m = Measurement {
            u: 0.0,
            v: 0.0,
            u_right: Some(0.0),
            inv_sigma2: 1.0,
        };
        let j = projection_jacobian(&pc, &cam, true);
        let h = 1e-6;
        for k in 0..3 {
            let mut d = Vector3::zeros();
            d[k] = h;
            let num = (m.residual(&(pc + d), &cam) - m.residual(&(pc - d), &cam)) / (2.0 * h);
            assert_relative_eq!(j.column(k).into_owned(), num, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_pose_jacobian_numerical() {
        let pose = SE3::new(UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3), Vector3::new(0.5, 0.1, -0.3));
        let p = Vector3::new(1.0, 2.0, 3.0);
        let pc = pose.transform_point(&p);
        let j = pose_point_jacobian(&pc);
        let h = 1e-7;
        for k in 0..6 {
            let mut d = Vector6::zeros();
            d[k] = h;
            let num = (pose.retract_left(&d).transform_point(&p) - pc) / h;
            assert_relative_eq!(j.column(k).into_owned(), num, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_huber() {
        assert_relative_eq!(huber_weight(1.0, 5.991), 1.0);
        assert!(huber_weight(100.0, 5.991) < 1.0);
        assert_relative_eq!(huber_cost(4.0, 4.0), 4.0);
        assert!(huber_cost(100.0, 4.0) < 100.0);
    }
}
