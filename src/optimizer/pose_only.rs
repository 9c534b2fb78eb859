//! Motion-only optimization of a single camera pose.
//!
//! Map points are fixed; only `T_cw` moves. Four rounds of ten LM
//! iterations, re-classifying outliers by χ² after each round. The robust
//! kernel is dropped for the last two rounds once outliers are out.

use nalgebra::{Matrix6, Vector3, Vector6};

use crate::atlas::map::Map;
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::{so3, CameraModel, SE3};
use crate::tracking::frame::Frame;

use super::{
    huber_cost, huber_weight, pose_point_jacobian, projection_jacobian, Measurement, LAMBDA_DOWN, LAMBDA_INIT,
    LAMBDA_MAX, LAMBDA_UP,
};

const ROUNDS: usize = 4;
const ITERATIONS_PER_ROUND: usize = 10;
const MIN_EDGES: usize = 10;

/// One fixed map point and where it was matched.
#[derive(Debug, Clone, Copy)]
pub struct PoseObservation {
    pub point_world: Vector3<f64>,
    pub measurement: Measurement,
}

/// Soft prior on the pose, e.g. from IMU prediction.
#[derive(Debug, Clone, Copy)]
pub struct PosePrior {
    pub pose_cw: SE3,
    /// Information on `[rotation, translation]`.
    pub information: Matrix6<f64>,
}

#[derive(Debug, Clone)]
pub struct PoseOptimizationResult {
    pub pose_cw: SE3,
    /// Index-aligned with the input observations.
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

fn prior_residual(pose: &SE3, prior: &PosePrior) -> Vector6<f64> {
    let dr = pose.rotation_matrix() * prior.pose_cw.rotation_matrix().transpose();
    let rot = so3::log(&dr);
    let trans = pose.translation - dr * prior.pose_cw.translation;
    Vector6::new(rot.x, rot.y, rot.z, trans.x, trans.y, trans.z)
}

struct Problem<'a> {
    observations: &'a [PoseObservation],
    camera: &'a CameraModel,
    prior: Option<&'a PosePrior>,
}

impl Problem<'_> {
    fn cost(&self, pose: &SE3, active: &[bool], robust: bool) -> f64 {
        let mut cost = 0.0;
        for (obs, _) in self.observations.iter().zip(active).filter(|(_, a)| **a) {
            let pc = pose.transform_point(&obs.point_world);
            if pc.z <= 0.0 {
                cost += obs.measurement.chi2_threshold() * 10.0;
                continue;
            }
            let chi2 = obs.measurement.chi2(&pc, self.camera);
            cost += if robust {
                huber_cost(chi2, obs.measurement.chi2_threshold())
            } else {
                chi2
            };
        }
        if let Some(prior) = self.prior {
            let r = prior_residual(pose, prior);
            cost += (r.transpose() * prior.information * r)[(0, 0)];
        }
        cost
    }

    fn normal_equations(&self, pose: &SE3, active: &[bool], robust: bool) -> (Matrix6<f64>, Vector6<f64>) {
        let mut h = Matrix6::zeros();
        let mut b = Vector6::zeros();
        for (obs, _) in self.observations.iter().zip(active).filter(|(_, a)| **a) {
            let pc = pose.transform_point(&obs.point_world);
            if pc.z <= 0.0 {
                continue;
            }
            let m = &obs.measurement;
            let r = m.residual(&pc, self.camera);
            let chi2 = r.norm_squared() * m.inv_sigma2;
            let w = if robust {
                huber_weight(chi2, m.chi2_threshold())
            } else {
                1.0
            } * m.inv_sigma2;
            let j = projection_jacobian(&pc, self.camera, m.is_stereo()) * pose_point_jacobian(&pc);
            h += j.transpose() * j * w;
            b -= j.transpose() * r * w;
        }
        if let Some(prior) = self.prior {
            let r = prior_residual(pose, prior);
            h += prior.information;
            b -= prior.information * r;
        }
        (h, b)
    }
}

/// Refine `T_cw` against fixed 3D points.
pub fn optimize_pose(
    initial_cw: &SE3,
    observations: &[PoseObservation],
    camera: &CameraModel,
    prior: Option<&PosePrior>,
) -> Result<PoseOptimizationResult> {
    if observations.len() < 3 && prior.is_none() {
        return Err(SlamError::OptimizationDivergence(format!(
            "{} observations are not enough to fix a pose",
            observations.len()
        )));
    }

    let problem = Problem {
        observations,
        camera,
        prior,
    };
    let mut pose = *initial_cw;
    let mut outliers = vec![false; observations.len()];

    for round in 0..ROUNDS {
        let robust = round < 2;
        let active: Vec<bool> = outliers.iter().map(|o| !o).collect();
        let mut cost = problem.cost(&pose, &active, robust);
        let mut lambda = LAMBDA_INIT;

        for _ in 0..ITERATIONS_PER_ROUND {
            let (h, b) = problem.normal_equations(&pose, &active, robust);
            let mut damped = h;
            for i in 0..6 {
                damped[(i, i)] += lambda * h[(i, i)].max(1e-6);
            }
            let Some(delta) = damped.cholesky().map(|c| c.solve(&b)) else {
                lambda *= LAMBDA_UP;
                continue;
            };
            let candidate = pose.retract_left(&delta);
            let new_cost = problem.cost(&candidate, &active, robust);
            if new_cost.is_finite() && new_cost < cost {
                pose = candidate;
                let converged = (cost - new_cost) < 1e-9 * cost.max(1e-12) || delta.norm() < 1e-10;
                cost = new_cost;
                lambda = (lambda * LAMBDA_DOWN).max(1e-12);
                if converged {
                    break;
                }
            } else {
                lambda *= LAMBDA_UP;
                if lambda > LAMBDA_MAX {
                    break;
                }
            }
        }

        // Re-classify every observation, including earlier outliers.
        let mut n_active = 0;
        for (obs, outlier) in observations.iter().zip(outliers.iter_mut()) {
            let pc = pose.transform_point(&obs.point_world);
            *outlier = pc.z <= 0.0 || obs.measurement.chi2(&pc, camera) > obs.measurement.chi2_threshold();
            if !*outlier {
                n_active += 1;
            }
        }
        if n_active < MIN_EDGES {
            break;
        }
    }

    if !pose.is_valid_rigid(1e-6) {
        return Err(SlamError::OptimizationDivergence("pose became non-finite".into()));
    }
    let num_inliers = outliers.iter().filter(|o| !**o).count();
    Ok(PoseOptimizationResult {
        pose_cw: pose,
        outliers,
        num_inliers,
    })
}

/// Optimize a tracked frame against its matched map points.
///
/// The frame pose and outlier flags are updated in place. Matches whose
/// point left the map are dropped. Returns the number of inliers.
pub fn optimize_frame_pose(
    frame: &mut Frame,
    map: &Map,
    camera: &CameraModel,
    pyramid: &ScalePyramid,
    prior: Option<&PosePrior>,
) -> Result<usize> {
    let initial = frame
        .pose_cw()
        .ok_or_else(|| SlamError::OptimizationDivergence("frame has no initial pose".into()))?;
    let mut indices = Vec::new();
    let mut observations = Vec::new();
    for idx in 0..frame.map_points.len() {
        let Some(mp_id) = frame.map_points[idx] else {
            continue;
        };
        let Some(mp) = map.get_map_point(mp_id) else {
            frame.map_points[idx] = None;
            continue;
        };
        indices.push(idx);
        observations.push(PoseObservation {
            point_world: mp.position,
            measurement: Measurement::from_features(&frame.features, idx, pyramid),
        });
    }
    let result = optimize_pose(&initial, &observations, camera, prior)?;
    for (idx, outlier) in indices.iter().zip(&result.outliers) {
        frame.outliers[*idx] = *outlier;
    }
    frame.pose = Some(result.pose_cw.inverse());
    Ok(result.num_inliers)
}
