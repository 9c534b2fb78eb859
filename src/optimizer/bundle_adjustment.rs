//! Bundle Adjustment over KeyFrame poses and MapPoint positions.
//!
//! Levenberg-Marquardt on the reprojection error with a Huber kernel,
//! solved through the Schur complement: the point blocks are 3x3 and
//! block-diagonal, so they are eliminated first and only the reduced pose
//! system is factorized.
//!
//! Local BA (local mapping, merge welding) optimizes a KeyFrame and its best
//! covisibles with the other observers of their points held fixed. Global BA
//! (loop closing) optimizes the whole map with the origin fixed.

use std::collections::{HashMap, HashSet, VecDeque};

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6x3, Vector3};
use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::error::{Result, SlamError};
use crate::features::ScalePyramid;
use crate::geometry::{CameraModel, SE3};

use super::{
    huber_cost, huber_weight, pose_point_jacobian, projection_jacobian, Measurement, LAMBDA_DOWN, LAMBDA_INIT,
    LAMBDA_MAX, LAMBDA_MIN, LAMBDA_UP,
};

/// Cost charged for a point behind its camera.
const BEHIND_CAMERA_CHI2: f64 = 1e4;

#[derive(Debug, Clone)]
pub struct BaKeyFrame {
    pub id: KeyFrameId,
    pub pose_cw: SE3,
    pub fixed: bool,
}

#[derive(Debug, Clone)]
pub struct BaPoint {
    pub id: MapPointId,
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub struct BaObservation {
    /// Index into `BaProblem::keyframes`.
    pub keyframe: usize,
    /// Index into `BaProblem::points`.
    pub point: usize,
    pub feature_idx: usize,
    pub measurement: Measurement,
}

/// Snapshot of the variables and measurements of one BA run.
#[derive(Debug, Clone, Default)]
pub struct BaProblem {
    pub keyframes: Vec<BaKeyFrame>,
    pub points: Vec<BaPoint>,
    pub observations: Vec<BaObservation>,
}

#[derive(Debug, Clone)]
pub struct BaSolution {
    /// Optimized camera-to-world poses of the non-fixed KeyFrames.
    pub poses: Vec<(KeyFrameId, SE3)>,
    pub points: Vec<(MapPointId, Vector3<f64>)>,
    /// Observations that ended above their χ² threshold or behind the camera.
    pub outliers: Vec<(KeyFrameId, usize, MapPointId)>,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Collect
// ─────────────────────────────────────────────────────────────────────────────

impl BaProblem {
    fn build(map: &Map, optimized: &[KeyFrameId], fixed_extra: &HashSet<KeyFrameId>, pyramid: &ScalePyramid) -> Self {
        let mut problem = BaProblem::default();
        let mut kf_index: HashMap<KeyFrameId, usize> = HashMap::new();
        let origin = map.origin_keyframe();
        for id in optimized {
            if let Some(kf) = map.get_keyframe(*id) {
                kf_index.insert(*id, problem.keyframes.len());
                problem.keyframes.push(BaKeyFrame {
                    id: *id,
                    pose_cw: kf.pose_cw(),
                    fixed: Some(*id) == origin,
                });
            }
        }

        let point_ids = map.get_map_points_from_keyframes(optimized);
        let mut point_ids: Vec<MapPointId> = point_ids.into_iter().collect();
        point_ids.sort();

        let mut fixed_ids: Vec<KeyFrameId> = fixed_extra.iter().copied().collect();
        for mp_id in &point_ids {
            if let Some(mp) = map.get_map_point(*mp_id) {
                fixed_ids.extend(mp.observations.keys().filter(|k| !kf_index.contains_key(k)).copied());
            }
        }
        fixed_ids.sort();
        fixed_ids.dedup();
        for id in fixed_ids {
            if kf_index.contains_key(&id) {
                continue;
            }
            if let Some(kf) = map.get_keyframe(id) {
                kf_index.insert(id, problem.keyframes.len());
                problem.keyframes.push(BaKeyFrame {
                    id,
                    pose_cw: kf.pose_cw(),
                    fixed: true,
                });
            }
        }

        for mp_id in point_ids {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            let point = problem.points.len();
            let mut observations: Vec<(&KeyFrameId, &usize)> = mp.observations.iter().collect();
            observations.sort();
            let mut added = 0;
            for (kf_id, idx) in observations {
                let (Some(k), Some(kf)) = (kf_index.get(kf_id), map.get_keyframe(*kf_id)) else {
                    continue;
                };
                if *idx >= kf.num_features() {
                    continue;
                }
                problem.observations.push(BaObservation {
                    keyframe: *k,
                    point,
                    feature_idx: *idx,
                    measurement: Measurement::from_features(&kf.features, *idx, pyramid),
                });
                added += 1;
            }
            if added > 0 {
                problem.points.push(BaPoint {
                    id: mp_id,
                    position: mp.position,
                });
            }
        }
        problem
    }

    /// Local window around `kf_id`: the KeyFrame and up to `max_keyframes - 1`
    /// best covisibles are optimized; other observers of their points are fixed.
    pub fn collect_local(map: &Map, kf_id: KeyFrameId, max_keyframes: usize, pyramid: &ScalePyramid) -> Option<Self> {
        map.get_keyframe(kf_id)?;
        let mut local = vec![kf_id];
        local.extend(map.get_local_keyframes(kf_id, max_keyframes.saturating_sub(1)));
        let mut problem = Self::build(map, &local, &HashSet::new(), pyramid);
        problem.ensure_gauge();
        problem.is_solvable().then_some(problem)
    }

    /// Welding window after a merge: both neighborhoods are optimized.
    pub fn collect_window(map: &Map, keyframes: &[KeyFrameId], pyramid: &ScalePyramid) -> Option<Self> {
        let mut problem = Self::build(map, keyframes, &HashSet::new(), pyramid);
        problem.ensure_gauge();
        problem.is_solvable().then_some(problem)
    }

    /// Every KeyFrame and MapPoint of the map, origin fixed.
    pub fn collect_global(map: &Map, pyramid: &ScalePyramid) -> Option<Self> {
        let ids = map.keyframe_ids();
        let mut problem = Self::build(map, &ids, &HashSet::new(), pyramid);
        problem.ensure_gauge();
        problem.is_solvable().then_some(problem)
    }

    /// Fix the oldest KeyFrame when nothing else anchors the problem.
    fn ensure_gauge(&mut self) {
        if self.keyframes.iter().any(|k| k.fixed) {
            return;
        }
        if let Some(oldest) = self.keyframes.iter_mut().min_by_key(|k| k.id) {
            oldest.fixed = true;
        }
    }

    fn is_solvable(&self) -> bool {
        !self.points.is_empty() && !self.observations.is_empty()
    }

    pub fn num_optimized_keyframes(&self) -> usize {
        self.keyframes.iter().filter(|k| !k.fixed).count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Solve
// ─────────────────────────────────────────────────────────────────────────────

struct State {
    poses: Vec<SE3>,
    points: Vec<Vector3<f64>>,
}

fn total_cost(problem: &BaProblem, state: &State, camera: &CameraModel) -> f64 {
    problem
        .observations
        .iter()
        .map(|o| {
            let pc = state.poses[o.keyframe].transform_point(&state.points[o.point]);
            let th = o.measurement.chi2_threshold();
            if pc.z <= 0.0 {
                huber_cost(BEHIND_CAMERA_CHI2, th)
            } else {
                huber_cost(o.measurement.chi2(&pc, camera), th)
            }
        })
        .sum()
}

/// One damped Schur-complement step. Returns `None` if the reduced system
/// cannot be factorized.
fn schur_step(
    problem: &BaProblem,
    state: &State,
    pose_param: &[Option<usize>],
    n_pose_params: usize,
    camera: &CameraModel,
    lambda: f64,
) -> Option<(DVector<f64>, Vec<Vector3<f64>>)> {
    let n = n_pose_params * 6;
    let mut h_pp = DMatrix::<f64>::zeros(n, n);
    let mut b_p = DVector::<f64>::zeros(n);
    let mut h_ll = vec![Matrix3::<f64>::zeros(); problem.points.len()];
    let mut b_l = vec![Vector3::<f64>::zeros(); problem.points.len()];
    let mut h_pl: Vec<Vec<(usize, Matrix6x3<f64>)>> = vec![Vec::new(); problem.points.len()];

    for o in &problem.observations {
        let pose = &state.poses[o.keyframe];
        let pc = pose.transform_point(&state.points[o.point]);
        if pc.z <= 0.0 {
            continue;
        }
        let m = &o.measurement;
        let r = m.residual(&pc, camera);
        let chi2 = r.norm_squared() * m.inv_sigma2;
        let w = huber_weight(chi2, m.chi2_threshold()) * m.inv_sigma2;
        let j_proj = projection_jacobian(&pc, camera, m.is_stereo());
        let j_point = j_proj * pose.rotation_matrix();

        h_ll[o.point] += j_point.transpose() * j_point * w;
        b_l[o.point] -= j_point.transpose() * r * w;

        if let Some(k) = pose_param[o.keyframe] {
            let j_pose = j_proj * pose_point_jacobian(&pc);
            let mut block = h_pp.view_mut((k * 6, k * 6), (6, 6));
            block += j_pose.transpose() * j_pose * w;
            let mut rhs = b_p.rows_mut(k * 6, 6);
            rhs -= j_pose.transpose() * r * w;
            h_pl[o.point].push((k, j_pose.transpose() * j_point * w));
        }
    }

    for i in 0..n {
        h_pp[(i, i)] += lambda * h_pp[(i, i)].max(1e-6);
    }
    let mut h_ll_inv = Vec::with_capacity(h_ll.len());
    for h in h_ll.iter_mut() {
        for i in 0..3 {
            h[(i, i)] += lambda * h[(i, i)].max(1e-6);
        }
        h_ll_inv.push(h.try_inverse());
    }

    // Reduce: S = H_pp - Σ H_pl H_ll⁻¹ H_plᵀ, b_s = b_p - Σ H_pl H_ll⁻¹ b_l.
    let mut schur = h_pp;
    let mut b_s = b_p;
    for (pt, blocks) in h_pl.iter().enumerate() {
        let Some(inv) = h_ll_inv[pt] else {
            continue;
        };
        for (ka, wa) in blocks {
            let wa_inv = wa * inv;
            let mut rhs = b_s.rows_mut(ka * 6, 6);
            rhs -= wa_inv * b_l[pt];
            for (kb, wb) in blocks {
                let mut block = schur.view_mut((ka * 6, kb * 6), (6, 6));
                block -= wa_inv * wb.transpose();
            }
        }
    }

    let delta_p = if n == 0 {
        DVector::zeros(0)
    } else {
        match schur.clone().cholesky() {
            Some(c) => c.solve(&b_s),
            None => schur.lu().solve(&b_s)?,
        }
    };

    let mut delta_l = Vec::with_capacity(problem.points.len());
    for (pt, blocks) in h_pl.iter().enumerate() {
        let Some(inv) = h_ll_inv[pt] else {
            delta_l.push(Vector3::zeros());
            continue;
        };
        let mut rhs = b_l[pt];
        for (k, w) in blocks {
            rhs -= w.transpose() * delta_p.rows(k * 6, 6);
        }
        delta_l.push(inv * rhs);
    }
    Some((delta_p, delta_l))
}

/// Run LM on a collected problem.
///
/// Returns `Ok(None)` when `should_stop` fired; nothing should be applied then.
pub fn solve(
    problem: &BaProblem,
    camera: &CameraModel,
    max_iterations: usize,
    should_stop: &dyn Fn() -> bool,
) -> Result<Option<BaSolution>> {
    let mut pose_param = Vec::with_capacity(problem.keyframes.len());
    let mut n_pose_params = 0;
    for kf in &problem.keyframes {
        if kf.fixed {
            pose_param.push(None);
        } else {
            pose_param.push(Some(n_pose_params));
            n_pose_params += 1;
        }
    }

    let mut state = State {
        poses: problem.keyframes.iter().map(|k| k.pose_cw).collect(),
        points: problem.points.iter().map(|p| p.position).collect(),
    };
    let initial_cost = total_cost(problem, &state, camera);
    if !initial_cost.is_finite() {
        return Err(SlamError::OptimizationDivergence("initial BA cost is not finite".into()));
    }

    let mut cost = initial_cost;
    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;
    for _ in 0..max_iterations {
        if should_stop() {
            return Ok(None);
        }
        iterations += 1;
        let Some((delta_p, delta_l)) = schur_step(problem, &state, &pose_param, n_pose_params, camera, lambda)
        else {
            lambda = (lambda * LAMBDA_UP).min(LAMBDA_MAX);
            continue;
        };

        let candidate = State {
            poses: state
                .poses
                .iter()
                .zip(&pose_param)
                .map(|(pose, param)| match param {
                    Some(k) => pose.retract_left(&delta_p.fixed_rows::<6>(k * 6).into_owned()),
                    None => *pose,
                })
                .collect(),
            points: state.points.iter().zip(&delta_l).map(|(p, d)| p + d).collect(),
        };
        let new_cost = total_cost(problem, &candidate, camera);
        if new_cost.is_finite() && new_cost < cost {
            let relative = (cost - new_cost) / cost.max(1e-12);
            state = candidate;
            cost = new_cost;
            lambda = (lambda * LAMBDA_DOWN).max(LAMBDA_MIN);
            if relative < 1e-6 {
                break;
            }
        } else {
            lambda *= LAMBDA_UP;
            if lambda > LAMBDA_MAX {
                break;
            }
        }
    }

    if !cost.is_finite() || cost > initial_cost {
        return Err(SlamError::OptimizationDivergence(format!(
            "BA cost went from {initial_cost:.3} to {cost:.3}"
        )));
    }

    let outliers = problem
        .observations
        .iter()
        .filter(|o| {
            let pc = state.poses[o.keyframe].transform_point(&state.points[o.point]);
            pc.z <= 0.0 || o.measurement.chi2(&pc, camera) > o.measurement.chi2_threshold()
        })
        .map(|o| (problem.keyframes[o.keyframe].id, o.feature_idx, problem.points[o.point].id))
        .collect();

    debug!(
        "[BA] {} kfs ({} fixed), {} points, {} edges: cost {:.2} -> {:.2} in {} iterations",
        problem.keyframes.len(),
        problem.keyframes.len() - n_pose_params,
        problem.points.len(),
        problem.observations.len(),
        initial_cost,
        cost,
        iterations
    );

    Ok(Some(BaSolution {
        poses: problem
            .keyframes
            .iter()
            .zip(&state.poses)
            .filter(|(k, _)| !k.fixed)
            .map(|(k, p)| (k.id, p.inverse()))
            .collect(),
        points: problem.points.iter().zip(&state.points).map(|(p, x)| (p.id, *x)).collect(),
        outliers,
        iterations,
        initial_cost,
        final_cost: cost,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Apply
// ─────────────────────────────────────────────────────────────────────────────

/// Write a solution back. Entities removed since collection are skipped and
/// outlier observations are dropped. Returns the number of updated KeyFrames.
pub fn apply(map: &mut Map, solution: &BaSolution, pyramid: &ScalePyramid) -> usize {
    let mut updated = 0;
    for (kf_id, pose) in &solution.poses {
        if let Some(kf) = map.get_keyframe_mut(*kf_id) {
            kf.pose = *pose;
            updated += 1;
        }
    }
    for (kf_id, idx, mp_id) in &solution.outliers {
        let observed = map.get_keyframe(*kf_id).and_then(|k| k.get_map_point(*idx)) == Some(*mp_id);
        if observed {
            map.disassociate(*kf_id, *idx);
        }
    }
    for (mp_id, position) in &solution.points {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            mp.position = *position;
        } else {
            continue;
        }
        map.update_map_point(*mp_id, pyramid);
    }
    updated
}

/// Apply a global BA solution to a map that kept changing while it ran.
///
/// KeyFrames created after collection follow their spanning-tree parent;
/// points created after collection follow their reference KeyFrame.
pub fn apply_global(map: &mut Map, solution: &BaSolution, pyramid: &ScalePyramid) -> usize {
    let old_poses: HashMap<KeyFrameId, SE3> = map.keyframes().map(|k| (k.id, k.pose)).collect();
    let optimized: HashMap<KeyFrameId, SE3> = solution.poses.iter().copied().collect();
    let mut new_poses: HashMap<KeyFrameId, SE3> = HashMap::new();

    let Some(origin) = map.origin_keyframe() else {
        return 0;
    };
    // Breadth-first over the spanning tree from the root(s).
    let mut roots: Vec<KeyFrameId> = map.keyframes().filter(|k| k.parent_id.is_none()).map(|k| k.id).collect();
    roots.sort();
    if !roots.contains(&origin) && map.contains_keyframe(origin) {
        roots.insert(0, origin);
    }
    let mut queue: VecDeque<KeyFrameId> = roots.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if new_poses.contains_key(&id) {
            continue;
        }
        let Some(kf) = map.get_keyframe(id) else {
            continue;
        };
        let pose = match optimized.get(&id) {
            Some(p) => *p,
            None => match kf.parent_id.and_then(|p| Some((new_poses.get(&p)?, old_poses.get(&p)?))) {
                Some((parent_new, parent_old)) => parent_new.compose(&parent_old.inverse().compose(&kf.pose)),
                None => kf.pose,
            },
        };
        new_poses.insert(id, pose);
        let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
        children.sort();
        queue.extend(children);
    }

    let optimized_points: HashMap<MapPointId, Vector3<f64>> = solution.points.iter().copied().collect();
    let point_ids: Vec<MapPointId> = map.map_points().map(|m| m.id).collect();
    for mp_id in point_ids {
        let Some(mp) = map.get_map_point(mp_id) else {
            continue;
        };
        let position = match optimized_points.get(&mp_id) {
            Some(p) => *p,
            None => {
                let r = mp.reference_kf;
                match (old_poses.get(&r), new_poses.get(&r)) {
                    (Some(old), Some(new)) => new.transform_point(&old.inverse().transform_point(&mp.position)),
                    _ => mp.position,
                }
            }
        };
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
        }
    }

    let mut updated = 0;
    for (id, pose) in &new_poses {
        if let Some(kf) = map.get_keyframe_mut(*id) {
            kf.pose = *pose;
            updated += 1;
        }
    }
    for (kf_id, idx, mp_id) in &solution.outliers {
        if map.get_keyframe(*kf_id).and_then(|k| k.get_map_point(*idx)) == Some(*mp_id) {
            map.disassociate(*kf_id, *idx);
        }
    }
    let point_ids: Vec<MapPointId> = map.map_points().map(|m| m.id).collect();
    for mp_id in point_ids {
        map.update_map_point(mp_id, pyramid);
    }
    updated
}
