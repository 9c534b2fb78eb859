//! Conversions to and from the rust-cv types.
//!
//! cv-core carries its own nalgebra release, so values cross the boundary
//! component by component.

use cv_core::nalgebra as cvna;
use cv_core::{FeatureMatch, FeatureWorldMatch, WorldPoint};
use cv_pinhole::NormalizedKeyPoint;
use nalgebra::{Matrix3, Vector3};

use super::SE3;

/// Bearing-to-world-point pair consumed by Lambda Twist.
pub type PnPMatch = FeatureWorldMatch<NormalizedKeyPoint>;
/// Two-view match consumed by the eight-point estimator.
pub type EpipolarMatch = FeatureMatch<NormalizedKeyPoint>;

/// Keypoint on the normalized image plane. `x` may be any ray with `z > 0`.
pub fn normalized_keypoint(x: &Vector3<f64>) -> NormalizedKeyPoint {
    NormalizedKeyPoint(cvna::Point2::new(x.x / x.z, x.y / x.z))
}

pub fn world_point(p: &Vector3<f64>) -> WorldPoint {
    WorldPoint(cvna::Vector4::new(p.x, p.y, p.z, 1.0))
}

/// Match between image 1 and image 2, so that `x2ᵀ E x1 = 0`.
pub fn feature_match(x1: &Vector3<f64>, x2: &Vector3<f64>) -> EpipolarMatch {
    FeatureMatch(normalized_keypoint(x1), normalized_keypoint(x2))
}

pub fn feature_world_match(bearing: &Vector3<f64>, point_world: &Vector3<f64>) -> PnPMatch {
    FeatureWorldMatch(normalized_keypoint(bearing), world_point(point_world))
}

pub fn matrix3(m: &cvna::Matrix3<f64>) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| m[(r, c)])
}

/// Rigid transform out of a rust-cv isometry.
pub fn se3(iso: &cvna::IsometryMatrix3<f64>) -> SE3 {
    let t = iso.translation.vector;
    SE3::from_rt(&matrix3(iso.rotation.matrix()), Vector3::new(t.x, t.y, t.z))
}
