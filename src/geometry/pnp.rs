//! Perspective-n-Point with RANSAC.
//!
//! Lambda Twist P3P hypotheses are ranked by ARRSAC. The winning pose is
//! then checked against each correspondence's own reprojection bound; the
//! caller refines it with the motion-only optimizer.

use arrsac::Arrsac;
use cv_core::sample_consensus::{Consensus, Estimator};
use lambda_twist::LambdaTwist;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{rustcv, SE3};

#[derive(Debug, Clone)]
pub struct PnPRansacParams {
    pub min_inliers: usize,
    /// Hypotheses drawn while ARRSAC estimates the inlier ratio.
    pub initialization_hypotheses: usize,
    /// Hypotheses kept for adaptive evaluation.
    pub max_candidate_hypotheses: usize,
}

impl Default for PnPRansacParams {
    fn default() -> Self {
        Self {
            min_inliers: 10,
            initialization_hypotheses: 256,
            max_candidate_hypotheses: 64,
        }
    }
}

/// Outcome of a RANSAC run.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// World-to-camera pose.
    pub pose_cw: SE3,
    pub inlier_mask: Vec<bool>,
    pub num_inliers: usize,
}

/// One 3D-2D correspondence. `bearing` lies on the normalized plane.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub point_world: Vector3<f64>,
    pub bearing: Vector3<f64>,
    /// Squared inlier threshold on the normalized plane.
    pub max_error_sq: f64,
}

fn classify(pose_cw: &SE3, corrs: &[Correspondence], mask: &mut [bool]) -> usize {
    let mut n = 0;
    for (c, m) in corrs.iter().zip(mask.iter_mut()) {
        let pc = pose_cw.transform_point(&c.point_world);
        *m = if pc.z > 0.0 {
            let du = pc.x / pc.z - c.bearing.x;
            let dv = pc.y / pc.z - c.bearing.y;
            du * du + dv * dv < c.max_error_sq
        } else {
            false
        };
        n += usize::from(*m);
    }
    n
}

pub fn solve_pnp_ransac<R: Rng>(
    corrs: &[Correspondence],
    params: &PnPRansacParams,
    rng: &mut R,
) -> Option<PnPResult> {
    let n = corrs.len();
    let min_samples = <LambdaTwist as Estimator<rustcv::PnPMatch>>::MIN_SAMPLES;
    if n < min_samples.max(params.min_inliers) {
        return None;
    }

    // ARRSAC scores `1 - cos` of the bearing error, about half the squared
    // error on the normalized plane.
    let threshold = 0.5 * corrs.iter().map(|c| c.max_error_sq).fold(0.0, f64::max);
    let samples: Vec<rustcv::PnPMatch> = corrs
        .iter()
        .map(|c| rustcv::feature_world_match(&c.bearing, &c.point_world))
        .collect();
    let mut arrsac = Arrsac::new(threshold, StdRng::seed_from_u64(rng.gen()))
        .initialization_hypotheses(params.initialization_hypotheses)
        .max_candidate_hypotheses(params.max_candidate_hypotheses);
    let model = arrsac.model(&LambdaTwist::new(), samples.iter().copied())?;

    let pose_cw = rustcv::se3(&model.0);
    if !pose_cw.is_valid_rigid(1e-6) {
        return None;
    }
    let mut inlier_mask = vec![false; n];
    let num_inliers = classify(&pose_cw, corrs, &mut inlier_mask);
    (num_inliers >= params.min_inliers).then_some(PnPResult {
        pose_cw,
        inlier_mask,
        num_inliers,
    })
}
